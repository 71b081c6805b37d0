//! Object registry
//!
//! Three typed identity tables (connections by integer handle, streams and
//! tracks by generated string handle) plus the data channel table, all
//! behind one short-lived lock. Engine calls never happen while the lock
//! is held.

use super::data_channel::DataChannelTable;
use super::peer_connection::PeerConnection;
use super::BridgeError;
use crate::capture::CaptureSource;
use crate::engine::{
    same_object, MediaStream, NativeDataChannel, NativeTrack, DEFAULT_STREAM_LABEL,
};
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Who produced a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    /// Created by `getUserMedia`
    Local,
    /// Announced by the engine for the given connection
    Remote(i32),
}

pub struct StreamEntry {
    pub stream: Arc<MediaStream>,
    pub origin: StreamOrigin,
    /// Connections this local stream has been added to
    pub attached: BTreeSet<i32>,
    /// Track handles, in announcement order
    pub tracks: Vec<String>,
}

#[derive(Clone)]
pub struct TrackEntry {
    pub track: Arc<dyn NativeTrack>,
    pub stream: Option<String>,
    /// Camera bound to a local video track
    pub source: Option<CaptureSource>,
}

/// Result of registering an engine-announced stream
pub struct AddedStream {
    pub stream_id: String,
    /// Every track of the stream with its handle
    pub tracks: Vec<(String, Arc<dyn NativeTrack>)>,
    /// True when an existing handle was reused
    pub reused: bool,
}

/// Entries removed together with a stream
pub struct RemovedStream {
    pub stream_id: String,
    pub stream: Arc<MediaStream>,
    pub tracks: Vec<(String, TrackEntry)>,
}

/// Everything a connection close took out of the registry
pub struct EvictedConnection {
    pub connection: Arc<PeerConnection>,
    pub streams: Vec<RemovedStream>,
    pub channels: Vec<Arc<dyn NativeDataChannel>>,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<i32, Arc<PeerConnection>>,
    streams: HashMap<String, StreamEntry>,
    tracks: HashMap<String, TrackEntry>,
    channels: DataChannelTable,
    /// Minted handles not yet inserted
    reserved: HashSet<String>,
}

impl Tables {
    fn is_live(&self, connection: &PeerConnection) -> bool {
        self.connections
            .get(&connection.handle())
            .is_some_and(|live| std::ptr::eq(Arc::as_ptr(live), connection))
    }

    fn is_taken(&self, id: &str) -> bool {
        self.streams.contains_key(id) || self.tracks.contains_key(id) || self.reserved.contains(id)
    }

    fn mint(&mut self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if !self.is_taken(&id) {
                self.reserved.insert(id.clone());
                return id;
            }
            debug!("Generated handle {} collides, retrying", id);
        }
    }

    fn track_handle(&mut self, track: &Arc<dyn NativeTrack>) -> String {
        let native_id = track.id();
        if !native_id.is_empty() && !self.is_taken(&native_id) {
            native_id
        } else {
            let id = self.mint();
            self.reserved.remove(&id);
            id
        }
    }

    fn stream_by_object(&self, stream: &Arc<MediaStream>) -> Option<String> {
        self.streams
            .iter()
            .find(|(_, entry)| same_object(&entry.stream, stream))
            .map(|(id, _)| id.clone())
    }

    /// Remote stream `connection` already registered for this native object
    fn remote_stream_of(&self, stream: &Arc<MediaStream>, connection: i32) -> Option<String> {
        self.streams
            .iter()
            .find(|(_, entry)| {
                same_object(&entry.stream, stream) && entry.origin == StreamOrigin::Remote(connection)
            })
            .map(|(id, _)| id.clone())
    }

    fn evict(&mut self, handle: i32) -> Option<EvictedConnection> {
        let connection = self.connections.remove(&handle)?;
        connection.mark_closed();

        let remote: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, entry)| entry.origin == StreamOrigin::Remote(handle))
            .map(|(id, _)| id.clone())
            .collect();
        let streams = remote
            .iter()
            .filter_map(|id| self.remove_stream(id))
            .collect();

        for entry in self.streams.values_mut() {
            entry.attached.remove(&handle);
        }
        let channels = self.channels.remove_connection(handle);

        Some(EvictedConnection {
            connection,
            streams,
            channels,
        })
    }

    fn remove_stream(&mut self, stream_id: &str) -> Option<RemovedStream> {
        let entry = self.streams.remove(stream_id)?;
        let tracks = entry
            .tracks
            .iter()
            .filter_map(|id| self.tracks.remove(id).map(|t| (id.clone(), t)))
            .collect();
        Some(RemovedStream {
            stream_id: stream_id.to_string(),
            stream: entry.stream,
            tracks,
        })
    }
}

#[derive(Default)]
pub struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // Connections

    pub fn insert_connection(
        &self,
        handle: i32,
        connection: Arc<PeerConnection>,
    ) -> Result<(), BridgeError> {
        let mut tables = self.tables.lock();
        if tables.connections.contains_key(&handle) {
            return Err(BridgeError::DuplicateConnection(handle));
        }
        tables.connections.insert(handle, connection);
        Ok(())
    }

    pub fn connection(&self, handle: i32) -> Option<Arc<PeerConnection>> {
        self.tables.lock().connections.get(&handle).cloned()
    }

    /// True while `connection` is the live entry for its handle
    pub fn is_current(&self, connection: &PeerConnection) -> bool {
        self.tables.lock().is_live(connection)
    }

    pub fn connection_handles(&self) -> Vec<i32> {
        let mut handles: Vec<i32> = self.tables.lock().connections.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Remove a connection and everything it owns.
    ///
    /// The connection is marked closed, its remote streams and their
    /// tracks are dropped, it is detached from local streams and its data
    /// channels leave the table, all under one lock.
    pub fn evict_connection(&self, handle: i32) -> Option<EvictedConnection> {
        self.tables.lock().evict(handle)
    }

    /// Remove a connection only if `connection` is still its live entry
    pub fn evict_if_current(&self, connection: &PeerConnection) -> Option<EvictedConnection> {
        let mut tables = self.tables.lock();
        if tables.is_live(connection) {
            tables.evict(connection.handle())
        } else {
            None
        }
    }

    // Handles

    /// Reserve a fresh stream handle
    pub fn mint_stream_id(&self) -> String {
        self.tables.lock().mint()
    }

    /// Reserve a fresh track handle
    pub fn mint_track_id(&self) -> String {
        self.tables.lock().mint()
    }

    /// Give back handles reserved for an aborted insertion
    pub fn release_reservations(&self, ids: &[String]) {
        let mut tables = self.tables.lock();
        for id in ids {
            tables.reserved.remove(id);
        }
    }

    // Streams

    /// Insert a `getUserMedia` stream under previously minted handles
    pub fn insert_local_stream(
        &self,
        stream_id: String,
        stream: Arc<MediaStream>,
        tracks: Vec<(String, Arc<dyn NativeTrack>, Option<CaptureSource>)>,
    ) {
        let mut tables = self.tables.lock();
        tables.reserved.remove(&stream_id);
        let mut handles = Vec::with_capacity(tracks.len());
        for (id, track, source) in tracks {
            tables.reserved.remove(&id);
            tables.tracks.insert(
                id.clone(),
                TrackEntry {
                    track,
                    stream: Some(stream_id.clone()),
                    source,
                },
            );
            handles.push(id);
        }
        tables.streams.insert(
            stream_id,
            StreamEntry {
                stream,
                origin: StreamOrigin::Local,
                attached: BTreeSet::new(),
                tracks: handles,
            },
        );
    }

    /// Register a stream announced by the engine for `connection`.
    ///
    /// A native stream this connection already announced keeps its handle
    /// and only gains the tracks it did not have. A stream labelled
    /// `default` is also matched against streams registered elsewhere.
    /// Returns `None` if the connection is gone.
    pub fn on_add_stream(
        &self,
        owner: &PeerConnection,
        stream: Arc<MediaStream>,
    ) -> Option<AddedStream> {
        let mut tables = self.tables.lock();
        if !tables.is_live(owner) {
            return None;
        }
        let connection = owner.handle();

        let existing = tables.remote_stream_of(&stream, connection).or_else(|| {
            if stream.label() == DEFAULT_STREAM_LABEL {
                tables.stream_by_object(&stream)
            } else {
                None
            }
        });
        let reused = existing.is_some();
        let stream_id = match existing {
            Some(id) => id,
            None => {
                let id = tables.mint();
                tables.reserved.remove(&id);
                id
            }
        };

        if !tables.streams.contains_key(&stream_id) {
            tables.streams.insert(
                stream_id.clone(),
                StreamEntry {
                    stream: stream.clone(),
                    origin: StreamOrigin::Remote(connection),
                    attached: BTreeSet::new(),
                    tracks: Vec::new(),
                },
            );
        }

        let mut result = Vec::new();
        for track in stream.tracks() {
            let known = tables.streams.get(&stream_id).and_then(|entry| {
                entry
                    .tracks
                    .iter()
                    .find(|id| {
                        tables
                            .tracks
                            .get(*id)
                            .is_some_and(|t| same_object(&t.track, &track))
                    })
                    .cloned()
            });
            let handle = match known {
                Some(id) => id,
                None => {
                    let id = tables.track_handle(&track);
                    tables.tracks.insert(
                        id.clone(),
                        TrackEntry {
                            track: track.clone(),
                            stream: Some(stream_id.clone()),
                            source: None,
                        },
                    );
                    if let Some(entry) = tables.streams.get_mut(&stream_id) {
                        entry.tracks.push(id.clone());
                    }
                    id
                }
            };
            result.push((handle, track));
        }

        Some(AddedStream {
            stream_id,
            tracks: result,
            reused,
        })
    }

    /// Drop a stream the engine reports as removed from `connection`
    pub fn on_remove_stream(
        &self,
        owner: &PeerConnection,
        stream: &Arc<MediaStream>,
    ) -> Option<RemovedStream> {
        let mut tables = self.tables.lock();
        if !tables.is_live(owner) {
            return None;
        }
        let connection = owner.handle();
        let id = tables.remote_stream_of(stream, connection)?;
        tables.remove_stream(&id)
    }

    pub fn stream(&self, stream_id: &str) -> Option<Arc<MediaStream>> {
        self.tables
            .lock()
            .streams
            .get(stream_id)
            .map(|entry| entry.stream.clone())
    }

    pub fn stream_tracks(&self, stream_id: &str) -> Option<Vec<String>> {
        self.tables
            .lock()
            .streams
            .get(stream_id)
            .map(|entry| entry.tracks.clone())
    }

    /// Local streams currently added to `connection`
    pub fn attached_streams(&self, connection: i32) -> Vec<String> {
        let tables = self.tables.lock();
        let mut ids: Vec<String> = tables
            .streams
            .iter()
            .filter(|(_, entry)| entry.attached.contains(&connection))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Record that `stream_id` was added to `connection`; false when either
    /// side is gone
    pub fn attach_stream(&self, stream_id: &str, connection: i32) -> bool {
        let mut tables = self.tables.lock();
        if !tables.connections.contains_key(&connection) {
            return false;
        }
        match tables.streams.get_mut(stream_id) {
            Some(entry) => {
                entry.attached.insert(connection);
                true
            }
            None => false,
        }
    }

    pub fn detach_stream(&self, stream_id: &str, connection: i32) -> bool {
        self.tables
            .lock()
            .streams
            .get_mut(stream_id)
            .is_some_and(|entry| entry.attached.remove(&connection))
    }

    /// Remove a stream and its tracks
    pub fn release_stream(&self, stream_id: &str) -> Option<RemovedStream> {
        self.tables.lock().remove_stream(stream_id)
    }

    // Tracks

    pub fn track(&self, track_id: &str) -> Option<Arc<dyn NativeTrack>> {
        self.tables
            .lock()
            .tracks
            .get(track_id)
            .map(|entry| entry.track.clone())
    }

    pub fn track_entry(&self, track_id: &str) -> Option<TrackEntry> {
        self.tables.lock().tracks.get(track_id).cloned()
    }

    pub fn set_track_source(&self, track_id: &str, source: Option<CaptureSource>) -> bool {
        match self.tables.lock().tracks.get_mut(track_id) {
            Some(entry) => {
                entry.source = source;
                true
            }
            None => false,
        }
    }

    /// Remove a track handle. The track also leaves its stream's handle
    /// list; the native stream is left alone.
    pub fn remove_track(&self, track_id: &str) -> Option<TrackEntry> {
        let mut tables = self.tables.lock();
        let entry = tables.tracks.remove(track_id)?;
        if let Some(ref stream_id) = entry.stream {
            if let Some(stream) = tables.streams.get_mut(stream_id) {
                stream.tracks.retain(|id| id != track_id);
            }
        }
        Some(entry)
    }

    // Data channels

    /// Insert a channel for a live connection
    pub fn insert_channel(&self, owner: &PeerConnection, channel: Arc<dyn NativeDataChannel>) -> bool {
        let mut tables = self.tables.lock();
        if !tables.is_live(owner) {
            return false;
        }
        tables.channels.insert(owner.handle(), channel)
    }

    pub fn channel(&self, connection: i32, id: i32) -> Option<Arc<dyn NativeDataChannel>> {
        self.tables.lock().channels.get(connection, id)
    }

    pub fn remove_channel(&self, connection: i32, id: i32) -> Option<Arc<dyn NativeDataChannel>> {
        self.tables.lock().channels.remove(connection, id)
    }

    // Counters

    pub fn connection_count(&self) -> usize {
        self.tables.lock().connections.len()
    }

    pub fn stream_count(&self) -> usize {
        self.tables.lock().streams.len()
    }

    pub fn track_count(&self) -> usize {
        self.tables.lock().tracks.len()
    }

    pub fn channel_count(&self) -> usize {
        self.tables.lock().channels.len()
    }

    /// Streams or tracks whose entries point at `connection`
    pub fn references_to(&self, connection: i32) -> usize {
        let tables = self.tables.lock();
        let streams = tables
            .streams
            .values()
            .filter(|entry| {
                entry.origin == StreamOrigin::Remote(connection)
                    || entry.attached.contains(&connection)
            })
            .count();
        let tracks = tables
            .tracks
            .values()
            .filter(|entry| {
                entry.stream.as_ref().is_some_and(|s| {
                    tables
                        .streams
                        .get(s)
                        .is_some_and(|st| st.origin == StreamOrigin::Remote(connection))
                })
            })
            .count();
        streams + tracks
    }

    /// Consistency check: every stream's track list resolves and every
    /// track's stream back-reference resolves
    pub fn is_consistent(&self) -> bool {
        let tables = self.tables.lock();
        let streams_ok = tables.streams.iter().all(|(sid, entry)| {
            entry.tracks.iter().all(|tid| {
                tables
                    .tracks
                    .get(tid)
                    .is_some_and(|t| t.stream.as_deref() == Some(sid.as_str()))
            }) && match entry.origin {
                StreamOrigin::Remote(h) => tables.connections.contains_key(&h),
                StreamOrigin::Local => true,
            }
        });
        let tracks_ok = tables.tracks.iter().all(|(tid, entry)| match &entry.stream {
            Some(sid) => tables
                .streams
                .get(sid)
                .is_some_and(|s| s.tracks.contains(tid)),
            None => true,
        });
        streams_ok && tracks_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackTrack;
    use crate::engine::MediaKind;

    fn remote_stream(label: &str, kinds: &[(&str, MediaKind)]) -> Arc<MediaStream> {
        let stream = Arc::new(MediaStream::new(label));
        for (id, kind) in kinds {
            stream.add_track(Arc::new(LoopbackTrack::new(*id, *kind)));
        }
        stream
    }

    fn registry_with(handle: i32) -> (Registry, Arc<PeerConnection>) {
        let registry = Registry::new();
        let connection = PeerConnection::detached(handle);
        registry.insert_connection(handle, connection.clone()).unwrap();
        (registry, connection)
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let (registry, _) = registry_with(1);
        assert_eq!(
            registry.insert_connection(1, PeerConnection::detached(1)),
            Err(BridgeError::DuplicateConnection(1))
        );
    }

    #[test]
    fn test_default_stream_reuses_handle() {
        let (registry, pc) = registry_with(1);
        let stream = remote_stream(DEFAULT_STREAM_LABEL, &[("a0", MediaKind::Audio)]);

        let first = registry.on_add_stream(&pc, stream.clone()).unwrap();
        let second = registry.on_add_stream(&pc, stream.clone()).unwrap();
        assert_eq!(first.stream_id, second.stream_id);
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(registry.stream_count(), 1);
        assert_eq!(registry.track_count(), 1);
        assert_eq!(first.tracks[0].0, second.tracks[0].0);
    }

    #[test]
    fn test_reannounced_default_stream_registers_new_tracks() {
        let (registry, pc) = registry_with(1);
        let stream = remote_stream(DEFAULT_STREAM_LABEL, &[("a0", MediaKind::Audio)]);
        registry.on_add_stream(&pc, stream.clone()).unwrap();

        stream.add_track(Arc::new(LoopbackTrack::new("v0", MediaKind::Video)));
        let again = registry.on_add_stream(&pc, stream).unwrap();
        assert_eq!(again.tracks.len(), 2);
        assert_eq!(registry.track_count(), 2);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_connection_handles_sorted() {
        let registry = Registry::new();
        for handle in [9, 2, 5] {
            registry
                .insert_connection(handle, PeerConnection::detached(handle))
                .unwrap();
        }
        assert_eq!(registry.connection_handles(), vec![2, 5, 9]);
    }

    #[test]
    fn test_reannounced_stream_keeps_handle_for_any_label() {
        let (registry, pc) = registry_with(1);
        let stream = remote_stream("peer-msid", &[("a0", MediaKind::Audio)]);
        let first = registry.on_add_stream(&pc, stream.clone()).unwrap();

        stream.add_track(Arc::new(LoopbackTrack::new("v0", MediaKind::Video)));
        let second = registry.on_add_stream(&pc, stream).unwrap();

        assert_eq!(first.stream_id, second.stream_id);
        assert!(second.reused);
        assert_eq!(second.tracks[0].0, first.tracks[0].0);
        assert_eq!(second.tracks[1].0, "v0");
        assert_eq!(registry.stream_count(), 1);
        assert_eq!(registry.track_count(), 2);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_same_object_on_another_connection_is_separate() {
        let (registry, pc1) = registry_with(1);
        let pc2 = PeerConnection::detached(2);
        registry.insert_connection(2, pc2.clone()).unwrap();
        let stream = remote_stream("peer-msid", &[]);

        let a = registry.on_add_stream(&pc1, stream.clone()).unwrap();
        let b = registry.on_add_stream(&pc2, stream).unwrap();
        assert_ne!(a.stream_id, b.stream_id);
        assert_eq!(registry.stream_count(), 2);
    }

    #[test]
    fn test_distinct_default_objects_get_distinct_handles() {
        let (registry, pc) = registry_with(1);
        let a = registry
            .on_add_stream(&pc, remote_stream(DEFAULT_STREAM_LABEL, &[]))
            .unwrap();
        let b = registry
            .on_add_stream(&pc, remote_stream(DEFAULT_STREAM_LABEL, &[]))
            .unwrap();
        assert_ne!(a.stream_id, b.stream_id);
    }

    #[test]
    fn test_colliding_native_track_id_gets_minted_handle() {
        let (registry, pc) = registry_with(1);
        let a = registry
            .on_add_stream(&pc, remote_stream("s1", &[("same", MediaKind::Audio)]))
            .unwrap();
        let b = registry
            .on_add_stream(&pc, remote_stream("s2", &[("same", MediaKind::Audio)]))
            .unwrap();
        assert_eq!(a.tracks[0].0, "same");
        assert_ne!(b.tracks[0].0, "same");
        assert_eq!(registry.track_count(), 2);
    }

    #[test]
    fn test_remove_stream_drops_tracks() {
        let (registry, pc) = registry_with(1);
        let stream = remote_stream(
            "s1",
            &[("a0", MediaKind::Audio), ("v0", MediaKind::Video)],
        );
        let added = registry.on_add_stream(&pc, stream.clone()).unwrap();

        assert!(registry
            .on_remove_stream(&PeerConnection::detached(1), &stream)
            .is_none());
        let removed = registry.on_remove_stream(&pc, &stream).unwrap();
        assert_eq!(removed.stream_id, added.stream_id);
        assert_eq!(removed.tracks.len(), 2);
        assert_eq!(registry.track_count(), 0);
        assert!(registry.stream(&added.stream_id).is_none());
        assert!(registry.on_remove_stream(&pc, &stream).is_none());
    }

    #[test]
    fn test_evict_cascades() {
        let (registry, pc) = registry_with(1);
        let pc2 = PeerConnection::detached(2);
        registry.insert_connection(2, pc2.clone()).unwrap();
        registry
            .on_add_stream(&pc, remote_stream("s1", &[("a0", MediaKind::Audio)]))
            .unwrap();
        let kept = registry
            .on_add_stream(&pc2, remote_stream("s2", &[("a1", MediaKind::Audio)]))
            .unwrap();

        let local_id = registry.mint_stream_id();
        registry.insert_local_stream(local_id.clone(), Arc::new(MediaStream::new("local")), vec![]);
        assert!(registry.attach_stream(&local_id, 1));

        let evicted = registry.evict_connection(1).unwrap();
        assert!(evicted.connection.is_closed());
        assert_eq!(evicted.streams.len(), 1);
        assert_eq!(registry.references_to(1), 0);
        assert!(registry.attached_streams(1).is_empty());
        assert!(registry.stream(&kept.stream_id).is_some());
        assert!(registry.stream(&local_id).is_some());
        assert!(registry.connection(1).is_none());
        assert!(registry.evict_connection(1).is_none());
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_add_stream_for_unknown_connection() {
        let registry = Registry::new();
        assert!(registry
            .on_add_stream(&PeerConnection::detached(9), remote_stream("s", &[]))
            .is_none());
        assert_eq!(registry.stream_count(), 0);
    }

    #[test]
    fn test_minted_ids_are_reserved() {
        let registry = Registry::new();
        let a = registry.mint_track_id();
        let b = registry.mint_track_id();
        assert_ne!(a, b);
        registry.release_reservations(&[a, b]);
    }

    #[test]
    fn test_remove_track_updates_stream() {
        let registry = Registry::new();
        let stream_id = registry.mint_stream_id();
        let track_id = registry.mint_track_id();
        let track: Arc<dyn NativeTrack> = Arc::new(LoopbackTrack::new(&track_id, MediaKind::Audio));
        registry.insert_local_stream(
            stream_id.clone(),
            Arc::new(MediaStream::new(&stream_id)),
            vec![(track_id.clone(), track, None)],
        );
        assert!(registry.remove_track(&track_id).is_some());
        assert_eq!(registry.stream_tracks(&stream_id), Some(vec![]));
        assert!(registry.remove_track(&track_id).is_none());
        assert!(registry.is_consistent());
    }
}
