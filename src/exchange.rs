//! Partition exchange between readers and joiners.
//!
//! An [`Output`] fans one reader's tuples out to a stream per destination
//! node; an [`Input`] fans the per-source streams of one joiner back in.
//! All streams of an input share a single arrival queue, so skew-key notices
//! and batches are observed in the order they were delivered.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::balance::NodeStatistic;
use crate::message::{DataMessage, Envelope};
use crate::plan::{StreamInfo, StreamKind};
use crate::queue::MessageQueue;
use crate::router::Router;
use crate::transport::Transport;
use crate::{Batch, NodeId, Result, StreamId, Tuple};

enum Arrival {
    SkewKey(String),
    Batch { partition: usize, batch: Batch },
}

// ============================================================================
// Inbound
// ============================================================================

/// Receiving end of one partition stream.
pub struct InStream {
    id: StreamId,
    kind: StreamKind,
    partition: usize,
    arrivals: Arc<MessageQueue<Arrival>>,
    received_bytes: AtomicU64,
}

impl InStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn push_batch(&self, batch: Batch) {
        self.arrivals.push(Arrival::Batch {
            partition: self.partition,
            batch,
        });
    }

    pub fn push_skew_key(&self, key: String) {
        self.arrivals.push(Arrival::SkewKey(key));
    }

    /// Deliver a message that crossed the transport.
    pub fn deliver(&self, msg: DataMessage, frame_len: usize) {
        self.received_bytes
            .fetch_add(frame_len as u64, Ordering::Relaxed);
        if msg.is_end() {
            self.push_batch(Batch::empty());
            return;
        }
        for key in msg.skew_keys {
            self.push_skew_key(key);
        }
        if let Some(batch) = msg.batch.filter(|b| !b.is_empty()) {
            self.push_batch(batch);
        }
    }
}

/// Fan-in of one table's partitions at a joiner.
pub struct Input {
    streams: Vec<Arc<InStream>>,
    arrivals: Arc<MessageQueue<Arrival>>,
    open: Vec<bool>,
    remaining: usize,
}

impl Input {
    pub fn new(infos: &[StreamInfo]) -> Self {
        let arrivals = Arc::new(MessageQueue::new());
        let streams = infos
            .iter()
            .enumerate()
            .map(|(partition, info)| {
                Arc::new(InStream {
                    id: info.id,
                    kind: info.kind,
                    partition,
                    arrivals: Arc::clone(&arrivals),
                    received_bytes: AtomicU64::new(0),
                })
            })
            .collect();
        Self {
            streams,
            arrivals,
            open: vec![true; infos.len()],
            remaining: infos.len(),
        }
    }

    pub fn streams(&self) -> &[Arc<InStream>] {
        &self.streams
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Next non-empty batch together with every skew key announced since the
    /// previous call. Returns an empty batch once all partitions have ended.
    pub fn next(&mut self) -> (Vec<String>, Batch) {
        let mut skew_keys = Vec::new();
        let mut seen = HashSet::new();
        while self.remaining > 0 {
            match self.arrivals.get() {
                Arrival::SkewKey(key) => {
                    if seen.insert(key.clone()) {
                        skew_keys.push(key);
                    }
                }
                Arrival::Batch { partition, batch } if batch.is_empty() => {
                    if std::mem::replace(&mut self.open[partition], false) {
                        self.remaining -= 1;
                    }
                }
                Arrival::Batch { batch, .. } => return (skew_keys, batch),
            }
        }
        (skew_keys, Batch::empty())
    }

    /// Encoded bytes received over the transport by all streams.
    pub fn received_bytes(&self) -> u64 {
        self.streams.iter().map(|s| s.received_bytes()).sum()
    }
}

// ============================================================================
// Outbound
// ============================================================================

enum Sink {
    Local(Arc<InStream>),
    Remote {
        node: NodeId,
        transport: Arc<dyn Transport>,
    },
}

/// Sending end of one partition stream.
pub struct OutStream {
    id: StreamId,
    sink: Sink,
    /// Skew keys already announced on this stream.
    announced: HashSet<String>,
}

impl OutStream {
    pub fn local(target: Arc<InStream>) -> Self {
        Self {
            id: target.id(),
            sink: Sink::Local(target),
            announced: HashSet::new(),
        }
    }

    pub fn remote(id: StreamId, node: NodeId, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            sink: Sink::Remote { node, transport },
            announced: HashSet::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn push_batch(&mut self, batch: Batch) -> Result<()> {
        match &self.sink {
            Sink::Local(target) => {
                target.push_batch(batch);
                Ok(())
            }
            Sink::Remote { node, transport } => {
                let msg = Envelope::Data(DataMessage::batch(self.id, batch));
                transport.send(*node, &msg).map(|_| ())
            }
        }
    }

    /// Announce `key` once; repeats are dropped.
    pub fn push_skew_key(&mut self, key: &str) -> Result<()> {
        if !self.announced.insert(key.to_string()) {
            return Ok(());
        }
        match &self.sink {
            Sink::Local(target) => {
                target.push_skew_key(key.to_string());
                Ok(())
            }
            Sink::Remote { node, transport } => {
                let msg = Envelope::Data(DataMessage::skew_key(self.id, key.to_string()));
                transport.send(*node, &msg).map(|_| ())
            }
        }
    }
}

/// Fan-out of one reader to every node, with per-destination batching.
pub struct Output {
    streams: Vec<OutStream>,
    pending: Vec<Batch>,
    stats: NodeStatistic,
    finished: bool,
}

impl Output {
    /// `streams` must be indexed by destination node.
    pub fn new(streams: Vec<OutStream>) -> Self {
        let nodes = streams.len();
        Self {
            streams,
            pending: (0..nodes).map(|_| Batch::empty()).collect(),
            stats: NodeStatistic::new(nodes),
            finished: false,
        }
    }

    pub fn nodes(&self) -> usize {
        self.streams.len()
    }

    pub fn stats(&self) -> &NodeStatistic {
        &self.stats
    }

    /// Route `tuple` through `router`.
    ///
    /// For a skewed tuple the router's notify set is announced before the row
    /// is buffered, and the send table is bumped per destination.
    pub fn send(&mut self, tuple: &Tuple, router: &mut Router, skewed: bool) -> Result<()> {
        let destinations = router.distribute(tuple, &self.stats);
        if skewed {
            for node in router.notify(tuple) {
                self.streams[node].push_skew_key(&tuple.key)?;
            }
        }

        for node in destinations {
            let batch = &mut self.pending[node];
            batch.push(tuple.clone());
            if batch.is_full() {
                let full = batch.take();
                self.streams[node].push_batch(full)?;
            }
            if skewed {
                self.stats.increment(node);
            }
        }
        Ok(())
    }

    /// Flush pending rows and send the end marker to every destination.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        for (stream, batch) in self.streams.iter_mut().zip(&mut self.pending) {
            if !batch.is_empty() {
                stream.push_batch(batch.take())?;
            }
            stream.push_batch(Batch::empty())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BATCH_SIZE;
    use crate::transport::MeshTransport;

    fn info(id: StreamId, kind: StreamKind, node: NodeId) -> StreamInfo {
        StreamInfo { id, kind, node }
    }

    #[test]
    fn input_bundles_skews_with_next_batch() {
        let mut input = Input::new(&[
            info(0, StreamKind::Local, 0),
            info(1, StreamKind::Remote, 1),
        ]);
        let [a, b] = [&input.streams()[0], &input.streams()[1]].map(Arc::clone);

        a.push_skew_key("k".into());
        a.push_skew_key("k".into());
        b.push_skew_key("j".into());
        a.push_batch(Batch::from_tuples(vec![Tuple::new("k", "1")]));
        a.push_batch(Batch::empty());
        b.push_skew_key("late".into());
        b.push_batch(Batch::empty());

        let (skews, batch) = input.next();
        assert_eq!(skews, vec!["k".to_string(), "j".to_string()]);
        assert_eq!(batch.len(), 1);

        let (skews, batch) = input.next();
        assert_eq!(skews, vec!["late".to_string()]);
        assert!(batch.is_empty());
        assert!(input.is_exhausted());

        // Stays exhausted.
        assert_eq!(input.next(), (vec![], Batch::empty()));
    }

    #[test]
    fn empty_partitions_finish_cleanly() {
        let mut input = Input::new(&[info(0, StreamKind::Local, 0)]);
        let mut output = Output::new(vec![OutStream::local(input.streams()[0].clone())]);
        output.finish().unwrap();
        output.finish().unwrap();
        assert_eq!(input.next(), (vec![], Batch::empty()));
    }

    #[test]
    fn output_batches_and_flushes() {
        let input = Input::new(&[info(0, StreamKind::Local, 0)]);
        let target = input.streams()[0].clone();
        let mut output = Output::new(vec![OutStream::local(target)]);
        let mut router = Router::hash(1);

        for i in 0..BATCH_SIZE + 3 {
            output
                .send(&Tuple::new(i.to_string(), "v"), &mut router, false)
                .unwrap();
        }
        // One full batch went out on its own.
        assert_eq!(input.arrivals.len(), 1);
        output.finish().unwrap();
        // Remainder plus the end marker.
        assert_eq!(input.arrivals.len(), 3);
    }

    #[test]
    fn notices_precede_rows_and_dedup() {
        let mut input = Input::new(&[
            info(0, StreamKind::Local, 0),
            info(1, StreamKind::Local, 1),
        ]);
        let streams = input.streams().iter().cloned().map(OutStream::local).collect();
        let mut output = Output::new(streams);
        let mut router = Router::keep_local_notify_all(0, 2);

        for _ in 0..3 {
            output.send(&Tuple::new("hot", "v"), &mut router, true).unwrap();
        }
        output.finish().unwrap();
        assert_eq!(output.stats().get(0), 3);
        assert_eq!(output.stats().get(1), 0);

        let (skews, batch) = input.next();
        assert_eq!(skews, vec!["hot".to_string()]);
        assert_eq!(batch.len(), 3);
        let (skews, batch) = input.next();
        assert!(skews.is_empty() && batch.is_empty());
    }

    #[test]
    fn remote_delivery_counts_bytes() {
        let mesh = Arc::new(MeshTransport::new(2));
        let input = Input::new(&[info(5, StreamKind::Remote, 0)]);
        let mut out = OutStream::remote(5, 1, mesh.clone());
        out.push_skew_key("k").unwrap();
        out.push_skew_key("k").unwrap();
        out.push_batch(Batch::empty()).unwrap();

        let inbox = mesh.inbox(1).unwrap();
        assert_eq!(inbox.len(), 2);
        while let Some(frame) = inbox.try_get() {
            let Envelope::Data(msg) = Envelope::decode(&frame).unwrap() else {
                panic!("expected data");
            };
            input.streams()[0].deliver(msg, frame.len());
        }
        assert_eq!(input.received_bytes(), mesh.bytes_to(1));
        assert_eq!(input.arrivals.len(), 2);
    }
}
