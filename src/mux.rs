//! The L2/L3 multiplexing fabric.
//!
//! Each registered device gets one bounded priority queue of outbound
//! [`L3Payload`]s and one driver task pumping that queue into the
//! device. Logical links map onto devices so the network layer can
//! address "the link to that neighbor" without knowing which port it
//! lives on.

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::datalink::FrameData;
use crate::util::BackoffGenerator;
use crate::AX25Call;

/// How long one send may keep retrying before the payload is dropped.
const RETRY_BUDGET: Duration = Duration::from_secs(20);

/// How long a queue take blocks before rechecking for shutdown.
const TAKE_POLL: Duration = Duration::from_secs(1);

/// Transmission priority. `Highest` drains first; FIFO within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    Highest = 0,
    Higher = 1,
    Default = 2,
    Lower = 3,
    Lowest = 4,
}

/// One network-layer datagram queued for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L3Payload {
    pub source: AX25Call,
    pub destination: AX25Call,
    pub protocol: u8,
    pub buffer: Vec<u8>,
    pub link_id: u64,
    pub qos: QoS,
    pub reliable: bool,
}

struct QueueEntry {
    payload: L3Payload,
    /// Arrival order, for FIFO within a QoS class.
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.payload.qos == other.payload.qos && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: invert so the smallest (qos, seq)
        // pair surfaces first
        other
            .payload
            .qos
            .cmp(&self.payload.qos)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

/// Bounded priority queue between the network layer and one device.
pub struct L3PriorityQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    available: Notify,
}

impl L3PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            capacity,
            available: Notify::new(),
        }
    }

    /// Non-blocking enqueue; `false` when the queue is full.
    pub fn offer(&self, payload: L3Payload) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.heap.len() >= self.capacity {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueueEntry { payload, seq });
        drop(inner);
        self.available.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(inner) => inner.heap.len(),
            Err(poisoned) => poisoned.into_inner().heap.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_take(&self) -> Option<L3Payload> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.heap.pop().map(|e| e.payload)
    }

    /// Take the best payload, waiting up to `wait` for one to arrive.
    pub async fn maybe_take(&self, wait: Duration) -> Option<L3Payload> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(payload) = self.try_take() {
                return Some(payload);
            }
            let notified = self.available.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_take();
            }
        }
    }
}

/// What the multiplexer requires of a device: identity, addressing, and
/// a non-blocking way to hand it a payload.
pub trait L2Protocol: Send + Sync {
    fn get_device_id(&self) -> u32;
    fn get_link_address(&self) -> AX25Call;
    fn get_peer_address(&self, link_id: u64) -> Option<AX25Call>;
    fn peer_connected(&self, link_id: u64) -> bool;
    /// Framed bytes arriving from the wire.
    fn receive_frame(&self, frame: FrameData);
    /// The inbound queue overflowed and frames were dropped.
    fn handle_queue_full(&self);
    fn maximum_transmission_unit(&self) -> usize;
    fn maximum_frame_size(&self) -> usize;
    /// Wrap an L3 payload in L2 headers and queue it for transmission.
    /// `false` means "not now" (link busy, peer choked); the driver will
    /// retry.
    fn send_packet(&self, payload: L3Payload) -> bool;
}

struct MuxInner {
    next_link_id: u64,
    devices: HashMap<u32, Arc<dyn L2Protocol>>,
    queues: HashMap<u32, Arc<L3PriorityQueue>>,
    links: HashMap<u64, Arc<dyn L2Protocol>>,
}

/// Registry of devices and the logical links running over them.
pub struct LinkMultiplexer {
    inner: Mutex<MuxInner>,
    queue_depth: usize,
    cancel: CancellationToken,
}

impl LinkMultiplexer {
    pub fn new(queue_depth: usize, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MuxInner {
                next_link_id: 0,
                devices: HashMap::new(),
                queues: HashMap::new(),
                links: HashMap::new(),
            }),
            queue_depth,
            cancel,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MuxInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a device, allocating its queue and spawning its driver.
    pub fn register_device(self: &Arc<Self>, l2: Arc<dyn L2Protocol>) {
        let device_id = l2.get_device_id();
        let queue = {
            let mut inner = self.lock();
            if inner.queues.contains_key(&device_id) {
                return;
            }
            let queue = Arc::new(L3PriorityQueue::new(self.queue_depth));
            inner.queues.insert(device_id, Arc::clone(&queue));
            inner.devices.insert(device_id, Arc::clone(&l2));
            queue
        };
        log::info!("registered device {device_id}");
        let mux = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            drive_l2(mux, queue, l2, cancel).await;
        });
    }

    /// Allocate a logical link over `l2`. Link ids are never reused.
    pub fn add_link(&self, l2: Arc<dyn L2Protocol>) -> u64 {
        let mut inner = self.lock();
        let link_id = inner.next_link_id;
        inner.next_link_id += 1;
        inner.links.insert(link_id, l2);
        link_id
    }

    pub fn get_link(&self, link_id: u64) -> Option<Arc<dyn L2Protocol>> {
        self.lock().links.get(&link_id).cloned()
    }

    /// The device queue serving `link_id`, if the link still exists.
    pub fn get_queue(&self, link_id: u64) -> Option<Arc<L3PriorityQueue>> {
        let inner = self.lock();
        let l2 = inner.links.get(&link_id)?;
        inner.queues.get(&l2.get_device_id()).cloned()
    }

    pub fn remove_link(&self, link_id: u64) {
        self.lock().links.remove(&link_id);
    }

    fn link_exists(&self, link_id: u64) -> bool {
        self.lock().links.contains_key(&link_id)
    }
}

/// Pump one device queue into its device, backing off when the device
/// refuses and dropping the payload once the retry budget is spent.
async fn drive_l2(
    mux: Arc<LinkMultiplexer>,
    queue: Arc<L3PriorityQueue>,
    l2: Arc<dyn L2Protocol>,
    cancel: CancellationToken,
) {
    let mut backoff = BackoffGenerator::new(
        Duration::from_millis(500),
        1.5,
        Duration::from_millis(3000),
    );
    while !cancel.is_cancelled() {
        let Some(payload) = queue.maybe_take(TAKE_POLL).await else {
            continue;
        };
        // payloads for a link that was torn down are not worth sending
        if !mux.link_exists(payload.link_id) {
            log::debug!(
                "dropping payload for removed link {} on device {}",
                payload.link_id,
                l2.get_device_id()
            );
            continue;
        }
        loop {
            if l2.send_packet(payload.clone()) {
                break;
            }
            if backoff.total() >= RETRY_BUDGET {
                log::warn!(
                    "gave up sending to {} on device {} after {:?}",
                    payload.destination,
                    l2.get_device_id(),
                    backoff.total()
                );
                break;
            }
            let delay = backoff.next_delay();
            log::debug!(
                "device {} refused payload, retrying in {:?}",
                l2.get_device_id(),
                delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        backoff.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn call(s: &str) -> AX25Call {
        AX25Call::parse(s).unwrap()
    }

    fn payload(qos: QoS, tag: u8, link_id: u64) -> L3Payload {
        L3Payload {
            source: call("N0CALL"),
            destination: call("N1CALL"),
            protocol: 0xCF,
            buffer: vec![tag],
            link_id,
            qos,
            reliable: true,
        }
    }

    #[tokio::test]
    async fn priority_order_then_fifo() {
        let queue = L3PriorityQueue::new(8);
        assert!(queue.offer(payload(QoS::Lower, 1, 0)));
        assert!(queue.offer(payload(QoS::Highest, 2, 0)));
        assert!(queue.offer(payload(QoS::Default, 3, 0)));
        assert!(queue.offer(payload(QoS::Highest, 4, 0)));

        let order: Vec<u8> = [
            queue.maybe_take(Duration::from_millis(10)).await,
            queue.maybe_take(Duration::from_millis(10)).await,
            queue.maybe_take(Duration::from_millis(10)).await,
            queue.maybe_take(Duration::from_millis(10)).await,
        ]
        .into_iter()
        .map(|p| p.unwrap().buffer[0])
        .collect();
        // Highest first, FIFO inside the class
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[tokio::test]
    async fn offer_fails_when_full() {
        let queue = L3PriorityQueue::new(2);
        assert!(queue.offer(payload(QoS::Default, 1, 0)));
        assert!(queue.offer(payload(QoS::Default, 2, 0)));
        assert!(!queue.offer(payload(QoS::Highest, 3, 0)));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn take_times_out_empty() {
        let queue = L3PriorityQueue::new(2);
        assert!(queue.maybe_take(Duration::from_millis(10)).await.is_none());
    }

    struct StubDevice {
        id: u32,
        address: AX25Call,
        accept: AtomicBool,
        sent: Mutex<Vec<L3Payload>>,
        refusals: AtomicUsize,
    }

    impl StubDevice {
        fn new(id: u32) -> Self {
            Self {
                id,
                address: call("N0CALL"),
                accept: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
                refusals: AtomicUsize::new(0),
            }
        }
    }

    impl L2Protocol for StubDevice {
        fn get_device_id(&self) -> u32 {
            self.id
        }
        fn get_link_address(&self) -> AX25Call {
            self.address
        }
        fn get_peer_address(&self, _link_id: u64) -> Option<AX25Call> {
            None
        }
        fn peer_connected(&self, _link_id: u64) -> bool {
            false
        }
        fn receive_frame(&self, _frame: FrameData) {}
        fn handle_queue_full(&self) {}
        fn maximum_transmission_unit(&self) -> usize {
            236
        }
        fn maximum_frame_size(&self) -> usize {
            330
        }
        fn send_packet(&self, payload: L3Payload) -> bool {
            if self.accept.load(Ordering::SeqCst) {
                self.sent.lock().unwrap().push(payload);
                true
            } else {
                self.refusals.fetch_add(1, Ordering::SeqCst);
                false
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn driver_pumps_queue_into_device() {
        let cancel = CancellationToken::new();
        let mux = LinkMultiplexer::new(8, cancel.clone());
        let device = Arc::new(StubDevice::new(0));
        mux.register_device(device.clone());
        let link_id = mux.add_link(device.clone());

        let queue = mux.get_queue(link_id).unwrap();
        assert!(queue.offer(payload(QoS::Default, 7, link_id)));

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(device.sent.lock().unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn driver_retries_with_backoff_until_accepted() {
        let cancel = CancellationToken::new();
        let mux = LinkMultiplexer::new(8, cancel.clone());
        let device = Arc::new(StubDevice::new(0));
        device.accept.store(false, Ordering::SeqCst);
        mux.register_device(device.clone());
        let link_id = mux.add_link(device.clone());

        mux.get_queue(link_id)
            .unwrap()
            .offer(payload(QoS::Default, 7, link_id));

        // a few refusals and backoff sleeps...
        for _ in 0..30 {
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        assert!(device.refusals.load(Ordering::SeqCst) >= 2);

        // ...then the device comes back
        device.accept.store(true, Ordering::SeqCst);
        for _ in 0..60 {
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        assert_eq!(device.sent.lock().unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn removed_link_payloads_are_discarded() {
        let cancel = CancellationToken::new();
        let mux = LinkMultiplexer::new(8, cancel.clone());
        let device = Arc::new(StubDevice::new(0));
        mux.register_device(device.clone());
        let link_id = mux.add_link(device.clone());

        let queue = mux.get_queue(link_id).unwrap();
        mux.remove_link(link_id);
        assert!(mux.get_queue(link_id).is_none());

        queue.offer(payload(QoS::Default, 7, link_id));
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert!(device.sent.lock().unwrap().is_empty());
        cancel.cancel();
    }

    #[test]
    fn link_ids_are_monotonic() {
        let mux = LinkMultiplexer::new(8, CancellationToken::new());
        let device = Arc::new(StubDevice::new(0));
        let a = mux.add_link(device.clone());
        let b = mux.add_link(device.clone());
        mux.remove_link(a);
        let c = mux.add_link(device);
        assert!(a < b && b < c);
    }
}
