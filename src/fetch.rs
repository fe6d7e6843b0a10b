//! Bidirectional fetch streams.
//!
//! A [`BdStream`] is one end of a per-node-pair channel. The local side asks
//! for keys with [`BdStream::fetch_key`]; the peer answers with rows for that
//! key followed by a single done marker. The same endpoint also serves the
//! peer's requests out of whatever data has been attached with
//! [`BdStream::attach`]. Requests that arrive before the data is attached are
//! parked and replayed in arrival order once it is.
//!
//! A `Local` stream connects a node to itself and never touches the
//! transport; a `Remote` stream sends [`FetchMessage`]s to its peer's stream
//! with the same id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::message::{Envelope, FetchMessage};
use crate::plan::StreamKind;
use crate::transport::Transport;
use crate::{BATCH_SIZE, Batch, NodeId, Result, StreamId, Tuple};

/// Rows grouped by join key; what a stream serves to its peer.
pub type BuildIndex = HashMap<String, Vec<Tuple>>;

pub struct BdStream {
    id: StreamId,
    kind: StreamKind,
    peer: NodeId,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    completed: Condvar,
    received_bytes: AtomicU64,
}

#[derive(Default)]
struct State {
    /// Servable data, attached once.
    data: Option<Arc<BuildIndex>>,
    /// Peer requests that arrived before `data`.
    parked: Vec<String>,
    /// Every key this end has asked for.
    requested: HashSet<String>,
    /// Requested keys not yet collected.
    outstanding: HashSet<String>,
    received: HashMap<String, Vec<Tuple>>,
    /// Keys whose done marker arrived, in arrival order.
    done: VecDeque<String>,
    fetching: bool,
}

impl BdStream {
    pub fn new(id: StreamId, kind: StreamKind, peer: NodeId, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            kind,
            peer,
            transport,
            state: Mutex::new(State {
                fetching: true,
                ..Default::default()
            }),
            completed: Condvar::new(),
            received_bytes: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Encoded bytes received from the peer. Always zero for local streams.
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    /// Ask the peer for every row with `key`. Repeated calls are no-ops.
    pub fn fetch_key(&self, key: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.requested.insert(key.to_string()) {
                return Ok(());
            }
            state.outstanding.insert(key.to_string());
        }

        match self.kind {
            StreamKind::Remote => self.send(FetchMessage::need(self.id, key.to_string())),
            StreamKind::Local => self.serve(key),
        }
    }

    /// End of the current fetch pass: no more `fetch_key` calls follow.
    pub fn fetch_done(&self) {
        let mut state = self.state.lock();
        state.fetching = false;
        debug!(
            stream_id = self.id,
            peer = self.peer,
            requested = state.requested.len(),
            outstanding = state.outstanding.len(),
            "fetch pass finished"
        );
    }

    /// Make `data` servable and answer every parked request.
    pub fn attach(&self, data: Arc<BuildIndex>) -> Result<()> {
        let parked = {
            let mut state = self.state.lock();
            debug_assert!(state.data.is_none(), "data attached twice");
            state.data = Some(data);
            std::mem::take(&mut state.parked)
        };
        if !parked.is_empty() {
            debug!(stream_id = self.id, parked = parked.len(), "replaying parked fetches");
        }
        for key in parked {
            self.serve(&key)?;
        }
        Ok(())
    }

    /// Handle a message from the peer's end of this stream.
    pub fn receive(&self, msg: FetchMessage, frame_len: usize) -> Result<()> {
        if msg.close {
            debug!(stream_id = self.id, peer = self.peer, "peer closed fetch stream");
        } else {
            self.received_bytes
                .fetch_add(frame_len as u64, Ordering::Relaxed);
        }

        for key in &msg.need_keys {
            self.serve(key)?;
        }

        let mut state = self.state.lock();
        if let Some(batch) = msg.batch {
            for tuple in batch {
                state.received.entry(tuple.key.clone()).or_default().push(tuple);
            }
        }
        let mut woke = false;
        for key in msg.done_keys {
            if state.outstanding.contains(&key) {
                state.done.push_back(key);
                woke = true;
            } else {
                state.received.remove(&key);
            }
        }
        drop(state);

        if woke {
            self.completed.notify_all();
        }
        Ok(())
    }

    /// Next completed fetch, without waiting.
    ///
    /// Returns `(key, rows)`, with empty `rows` when the peer had none.
    pub fn try_collect(&self) -> Option<(String, Vec<Tuple>)> {
        let mut state = self.state.lock();
        Self::pop_done(&mut state)
    }

    /// Next completed fetch, waiting while requested keys are still in flight.
    ///
    /// Returns `None` once every requested key has been collected.
    pub fn collect(&self) -> Option<(String, Vec<Tuple>)> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = Self::pop_done(&mut state) {
                return Some(item);
            }
            if state.outstanding.is_empty() {
                return None;
            }
            self.completed.wait(&mut state);
        }
    }

    pub fn has_outstanding(&self) -> bool {
        !self.state.lock().outstanding.is_empty()
    }

    /// Tell the peer this end is finished. No-op on local streams.
    pub fn close(&self) -> Result<()> {
        match self.kind {
            StreamKind::Remote => self.send(FetchMessage::close(self.id)),
            StreamKind::Local => Ok(()),
        }
    }

    fn pop_done(state: &mut State) -> Option<(String, Vec<Tuple>)> {
        let key = state.done.pop_front()?;
        state.outstanding.remove(&key);
        let rows = state.received.remove(&key).unwrap_or_default();
        Some((key, rows))
    }

    /// Serve `key` to the peer, or park it until data is attached.
    fn serve(&self, key: &str) -> Result<()> {
        let data = {
            let mut state = self.state.lock();
            match &state.data {
                Some(data) => Arc::clone(data),
                None => {
                    state.parked.push(key.to_string());
                    return Ok(());
                }
            }
        };
        let rows = data.get(key).map(Vec::as_slice).unwrap_or_default();

        match self.kind {
            StreamKind::Local => {
                let mut state = self.state.lock();
                if !state.outstanding.contains(key) {
                    return Ok(());
                }
                state
                    .received
                    .entry(key.to_string())
                    .or_default()
                    .extend_from_slice(rows);
                state.done.push_back(key.to_string());
                drop(state);
                self.completed.notify_all();
                Ok(())
            }
            StreamKind::Remote => {
                let mut chunks = rows.chunks(BATCH_SIZE).peekable();
                while let Some(chunk) = chunks.next() {
                    if chunks.peek().is_none() {
                        // Last chunk travels with the done marker.
                        let mut msg = FetchMessage::done(self.id, key.to_string());
                        msg.batch = Some(Batch::from_tuples(chunk.to_vec()));
                        return self.send(msg);
                    }
                    self.send(FetchMessage::rows(self.id, Batch::from_tuples(chunk.to_vec())))?;
                }
                self.send(FetchMessage::done(self.id, key.to_string()))
            }
        }
    }

    fn send(&self, msg: FetchMessage) -> Result<()> {
        self.transport.send(self.peer, &Envelope::Fetch(msg))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;
    use crate::transport::MeshTransport;

    fn index(rows: &[(&str, &str)]) -> Arc<BuildIndex> {
        let mut index = BuildIndex::new();
        for (k, v) in rows {
            index.entry(k.to_string()).or_default().push(Tuple::new(*k, *v));
        }
        Arc::new(index)
    }

    /// Two remote ends of stream 7 between nodes 0 and 1, plus a pump that
    /// forwards queued frames to the right end.
    struct Pair {
        mesh: Arc<MeshTransport>,
        ends: [BdStream; 2],
    }

    impl Pair {
        fn new() -> Self {
            let mesh = Arc::new(MeshTransport::new(2));
            let transport: Arc<dyn Transport> = mesh.clone();
            let ends = [
                BdStream::new(7, StreamKind::Remote, 1, transport.clone()),
                BdStream::new(7, StreamKind::Remote, 0, transport),
            ];
            Self { mesh, ends }
        }

        fn pump(&self) {
            loop {
                let mut moved = false;
                for node in 0..2 {
                    let inbox = self.mesh.inbox(node).unwrap();
                    while let Some(frame) = inbox.try_get() {
                        moved = true;
                        match Envelope::decode(&frame).unwrap() {
                            Envelope::Fetch(msg) => self.ends[node].receive(msg, frame.len()).unwrap(),
                            other => panic!("unexpected {other:?}"),
                        }
                    }
                }
                if !moved {
                    break;
                }
            }
        }
    }

    #[test]
    fn local_fetch_before_and_after_attach() {
        let transport: Arc<dyn Transport> = Arc::new(MeshTransport::new(1));
        let stream = BdStream::new(1, StreamKind::Local, 0, transport);

        stream.fetch_key("a").unwrap();
        assert!(stream.try_collect().is_none());
        assert!(stream.has_outstanding());

        stream.attach(index(&[("a", "1"), ("a", "3"), ("b", "2")])).unwrap();
        let (key, rows) = stream.try_collect().unwrap();
        assert_eq!(key, "a");
        assert_eq!(rows.len(), 2);

        stream.fetch_key("zzz").unwrap();
        assert_eq!(stream.collect(), Some(("zzz".to_string(), vec![])));
        assert_eq!(stream.collect(), None);
        assert_eq!(stream.received_bytes(), 0);
    }

    #[test]
    fn duplicate_fetch_yields_one_result() {
        let pair = Pair::new();
        pair.ends[1].attach(index(&[("a", "1")])).unwrap();

        pair.ends[0].fetch_key("a").unwrap();
        pair.ends[0].fetch_key("a").unwrap();
        pair.pump();

        assert_eq!(
            pair.ends[0].try_collect(),
            Some(("a".to_string(), vec![Tuple::new("a", "1")]))
        );
        assert!(pair.ends[0].try_collect().is_none());
        assert!(pair.ends[0].received_bytes() > 0);
    }

    #[test]
    fn parked_requests_replay_in_order() {
        let pair = Pair::new();
        for key in ["x", "y", "z"] {
            pair.ends[0].fetch_key(key).unwrap();
        }
        pair.pump();
        assert!(pair.ends[0].try_collect().is_none());

        pair.ends[1].attach(index(&[("y", "1")])).unwrap();
        pair.pump();

        let order: Vec<_> = std::iter::from_fn(|| pair.ends[0].try_collect())
            .map(|(k, rows)| (k, rows.len()))
            .collect();
        assert_eq!(
            order,
            vec![("x".to_string(), 0), ("y".to_string(), 1), ("z".to_string(), 0)]
        );
    }

    #[test]
    fn rows_only_collectible_after_done() {
        let pair = Pair::new();
        pair.ends[0].fetch_key("k").unwrap();

        let mut batch = Batch::empty();
        batch.push(Tuple::new("k", "1"));
        pair.ends[0].receive(FetchMessage::rows(7, batch), 10).unwrap();
        assert!(pair.ends[0].try_collect().is_none());

        pair.ends[0]
            .receive(FetchMessage::done(7, "k".to_string()), 10)
            .unwrap();
        assert_eq!(pair.ends[0].try_collect().unwrap().1.len(), 1);
    }

    #[test]
    fn unrequested_done_is_ignored() {
        let pair = Pair::new();
        pair.ends[0]
            .receive(FetchMessage::done(7, "ghost".to_string()), 4)
            .unwrap();
        assert!(pair.ends[0].try_collect().is_none());
        assert_eq!(pair.ends[0].collect(), None);
    }

    #[test]
    fn large_key_spans_batches() {
        let pair = Pair::new();
        let rows: Vec<_> = (0..BATCH_SIZE * 2 + 5)
            .map(|i| ("hot", i.to_string()))
            .collect();
        let mut data = BuildIndex::new();
        data.insert(
            "hot".to_string(),
            rows.iter().map(|(k, v)| Tuple::new(*k, v.clone())).collect(),
        );
        pair.ends[1].attach(Arc::new(data)).unwrap();

        pair.ends[0].fetch_key("hot").unwrap();
        pair.pump();
        let (_, fetched) = pair.ends[0].collect().unwrap();
        assert_eq!(fetched.len(), BATCH_SIZE * 2 + 5);
        assert_eq!(fetched[BATCH_SIZE].value, BATCH_SIZE.to_string());
    }

    #[test]
    fn collect_blocks_until_peer_answers() {
        let pair = Pair::new();
        pair.ends[0].fetch_key("a").unwrap();
        pair.ends[0].fetch_done();
        std::thread::scope(|s| {
            let waiter = s.spawn(|| pair.ends[0].collect());
            pair.ends[1].attach(index(&[("a", "9")])).unwrap();
            pair.pump();
            assert_eq!(waiter.join().unwrap().unwrap().1, vec![Tuple::new("a", "9")]);
        });
    }
}
