//! The producer mailbox: the bridge between the real-time sampler and the
//! dispatcher thread.
//!
//! Once per base tick the producer snapshots the signal image, appends one
//! record per due sample-time to the shared [`SampleRing`], publishes the
//! write cursor, and wakes the dispatcher if anyone is streaming. Work per
//! tick is independent of the subscriber count; decimation is entirely the
//! sessions' business.
//!
//! Cross-thread traffic in the other direction (parameter writes, halt
//! requests) travels through a lock-free single-producer/single-consumer
//! queue drained between ticks.

use crate::registry::{ParameterTable, Variable};
use crate::ring::{SampleRing, SampleWriter};
use byteorder::{ByteOrder, LittleEndian};
use crossbeam_utils::CachePadded;
use mio::{Ready, SetReadiness};
use rtkit::logging::{self, Logger};
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const RECORD_HEADER_LEN: usize = 15;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecordKind {
    /// Payload is the signal image for one tick of the record's
    /// sample-time.
    Data,
    /// Payload is a parameter id and its new raw value.
    ParamChange,
    /// The real-time side confirmed a halt request; no payload.
    Halt,
}

impl RecordKind {
    fn from_u8(value: u8) -> Option<RecordKind> {
        match value {
            0 => Some(RecordKind::Data),
            1 => Some(RecordKind::ParamChange),
            2 => Some(RecordKind::Halt),
            _ => None,
        }
    }
}

/// Fixed-size record header: kind, sample-time index, tick counter and
/// payload length, all little-endian.
#[derive(Debug, Eq, PartialEq)]
pub struct RecordHeader {
    pub kind: RecordKind,
    pub sample_time: u16,
    pub tick: u64,
    pub len: u32,
}

impl RecordHeader {
    pub fn encode(&self, out: &mut [u8; RECORD_HEADER_LEN]) {
        out[0] = self.kind as u8;
        LittleEndian::write_u16(&mut out[1..3], self.sample_time);
        LittleEndian::write_u64(&mut out[3..11], self.tick);
        LittleEndian::write_u32(&mut out[11..15], self.len);
    }

    pub fn decode(bytes: &[u8; RECORD_HEADER_LEN]) -> Option<RecordHeader> {
        Some(RecordHeader {
            kind: RecordKind::from_u8(bytes[0])?,
            sample_time: LittleEndian::read_u16(&bytes[1..3]),
            tick: LittleEndian::read_u64(&bytes[3..11]),
            len: LittleEndian::read_u32(&bytes[11..15]),
        })
    }
}

/// One complete record copied out of the sample ring.
#[derive(Debug)]
pub struct Record {
    pub header: RecordHeader,
    pub payload: Vec<u8>,
}

/// Copies the next whole record at the reader cursor, if one has been
/// published. The producer publishes per tick, so a visible header always
/// has its payload visible too.
pub fn read_record(ring: &SampleRing, rpos: &mut u64) -> Option<Record> {
    if ring.available(*rpos) < RECORD_HEADER_LEN {
        return None;
    }

    let mut header_bytes = [0u8; RECORD_HEADER_LEN];
    let mut peek = *rpos;
    ring.read_into(&mut peek, &mut header_bytes);

    let header = match RecordHeader::decode(&header_bytes) {
        Some(header) => header,
        None => return None,
    };

    if ring.available(peek) < header.len as usize {
        return None;
    }

    let mut payload = vec![0u8; header.len as usize];
    ring.read_into(&mut peek, &mut payload);

    *rpos = peek;
    Some(Record { header, payload })
}

// ---------------------------------------------------------------------
// Control queue (dispatcher -> producer)
// ---------------------------------------------------------------------

#[derive(Debug, Eq, PartialEq)]
pub enum ControlRequest {
    ParamWrite { id: usize, value: Vec<u8> },
    Halt,
}

struct ControlRing {
    slots: Box<[UnsafeCell<Option<ControlRequest>>]>,
    mask: usize,
    /// Consumer cursor (producer thread).
    head: CachePadded<AtomicUsize>,
    /// Producer cursor (dispatcher thread).
    tail: CachePadded<AtomicUsize>,
}

unsafe impl Send for ControlRing {}
unsafe impl Sync for ControlRing {}

/// Builds the two endpoints of the control queue. Capacity is rounded up
/// to a power of two.
pub fn control_queue(capacity: usize) -> (ControlSender, ControlReceiver) {
    let capacity = capacity.next_power_of_two().max(2);

    let mut slots = Vec::with_capacity(capacity);
    for _ in 0..capacity {
        slots.push(UnsafeCell::new(None));
    }

    let ring = Arc::new(ControlRing {
        slots: slots.into_boxed_slice(),
        mask: capacity - 1,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });

    (
        ControlSender { ring: ring.clone() },
        ControlReceiver { ring },
    )
}

/// Dispatcher-side endpoint. Sessions push through the shared context;
/// everything on that side runs on one thread.
pub struct ControlSender {
    ring: Arc<ControlRing>,
}

impl ControlSender {
    /// Enqueues a request, handing it back when the queue is full.
    pub fn push(&self, request: ControlRequest) -> Result<(), ControlRequest> {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) > self.ring.mask {
            return Err(request);
        }

        unsafe {
            *self.ring.slots[tail & self.ring.mask].get() = Some(request);
        }

        self.ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }
}

/// Producer-side endpoint.
pub struct ControlReceiver {
    ring: Arc<ControlRing>,
}

impl ControlReceiver {
    pub fn pop(&self) -> Option<ControlRequest> {
        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let request = unsafe { (*self.ring.slots[head & self.ring.mask].get()).take() };

        self.ring.head.store(head.wrapping_add(1), Ordering::Release);
        request
    }
}

// ---------------------------------------------------------------------
// Latest-value snapshot (seqlock)
// ---------------------------------------------------------------------

/// The most recent signal and parameter images, readable from the
/// dispatcher thread without touching the ring. Classic seqlock: the
/// sequence is odd while an update is in flight; readers retry until they
/// observe the same even value on both sides of the copy.
pub struct Snapshot {
    seq: AtomicUsize,
    data: UnsafeCell<Box<[u8]>>,
    signal_len: usize,
}

unsafe impl Send for Snapshot {}
unsafe impl Sync for Snapshot {}

impl Snapshot {
    pub fn new(signal_len: usize, param_len: usize) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            seq: AtomicUsize::new(0),
            data: UnsafeCell::new(vec![0u8; signal_len + param_len].into_boxed_slice()),
            signal_len,
        })
    }

    /// Producer-side update of one region of the snapshot.
    pub(crate) fn update(&self, offset: usize, bytes: &[u8]) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        unsafe {
            let data = &mut *self.data.get();
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        }

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::thread::yield_now();
                continue;
            }

            unsafe {
                let data = &*self.data.get();
                dst.copy_from_slice(&data[offset..offset + dst.len()]);
            }

            fence(Ordering::Acquire);

            if self.seq.load(Ordering::Relaxed) == before {
                return;
            }
        }
    }

    /// Current value of a signal variable.
    pub fn read_signal(&self, var: &Variable) -> Vec<u8> {
        let mut bytes = vec![0u8; var.byte_len()];
        self.read(var.offset, &mut bytes);
        bytes
    }

    /// Current value of a parameter variable.
    pub fn read_param(&self, var: &Variable) -> Vec<u8> {
        let mut bytes = vec![0u8; var.byte_len()];
        self.read(self.signal_len + var.offset, &mut bytes);
        bytes
    }
}

// ---------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------

/// Source of the signal image. In production this wraps the shared-memory
/// image of the real-time process; tests and the demo daemon substitute a
/// synthetic one. The snapshot itself is atomic as far as this interface
/// is concerned.
pub trait ImageSource: Send {
    fn image_len(&self) -> usize;

    /// Fills `dst` with the image for the given base-rate tick.
    fn sample(&mut self, tick: u64, dst: &mut [u8]);
}

pub struct Producer {
    writer: SampleWriter,
    control: ControlReceiver,
    snapshot: Arc<Snapshot>,
    source: Box<dyn ImageSource>,
    params: Arc<ParameterTable>,

    signal_image: Vec<u8>,
    param_image: Vec<u8>,

    /// Base-tick divisor of every sample-time.
    sample_decimations: Vec<u64>,
    /// Per-sample-time tick counters.
    ticks: Vec<u64>,
    base_tick: u64,
    base_period: Duration,

    streaming: Arc<AtomicUsize>,
    waker: SetReadiness,
    shutdown: Arc<AtomicBool>,
    halted: bool,

    log: Logger,
}

#[derive(Debug)]
pub enum ProducerError {
    /// One record (header + image) must fit the ring's single-write cap.
    RingTooSmall { record: usize, max_write: usize },
}

impl Producer {
    pub fn new(
        ring: Arc<SampleRing>,
        control: ControlReceiver,
        snapshot: Arc<Snapshot>,
        source: Box<dyn ImageSource>,
        params: Arc<ParameterTable>,
        sample_decimations: Vec<u64>,
        base_period: Duration,
        streaming: Arc<AtomicUsize>,
        waker: SetReadiness,
        shutdown: Arc<AtomicBool>,
        log: Logger,
    ) -> Result<Producer, ProducerError> {
        let image_len = source.image_len();
        let record = RECORD_HEADER_LEN + image_len;
        let max_write = ring.capacity() / crate::ring::MAX_WRITE_DIV;

        if record > max_write {
            return Err(ProducerError::RingTooSmall { record, max_write });
        }

        let param_image = vec![0u8; params.image_len()];
        let tick_count = sample_decimations.len();

        Ok(Producer {
            writer: SampleWriter::new(ring),
            control,
            snapshot,
            source,
            params,
            signal_image: vec![0u8; image_len],
            param_image,
            sample_decimations,
            ticks: vec![0; tick_count],
            base_tick: 0,
            base_period,
            streaming,
            waker,
            shutdown,
            halted: false,
            log,
        })
    }

    /// Runs the tick loop until shutdown. The base period stands in for
    /// the real-time timebase.
    pub fn run(&mut self) {
        logging::info!(self.log, "producer running";
                       "period_us" => self.base_period.as_micros() as u64,
                       "sample_times" => self.sample_decimations.len());

        while !self.shutdown.load(Ordering::Relaxed) {
            self.tick();
            std::thread::sleep(self.base_period);
        }

        logging::info!(self.log, "producer stopped");
    }

    /// One base tick: drain control requests, emit due records, publish,
    /// wake the dispatcher.
    pub fn tick(&mut self) {
        let mut wrote = self.drain_control();

        if !self.halted {
            let tick = self.base_tick;
            self.source.sample(tick, &mut self.signal_image);
            self.snapshot.update(0, &self.signal_image);

            for st in 0..self.sample_decimations.len() {
                if self.base_tick % self.sample_decimations[st] != 0 {
                    continue;
                }

                let header = RecordHeader {
                    kind: RecordKind::Data,
                    sample_time: st as u16,
                    tick: self.ticks[st],
                    len: self.signal_image.len() as u32,
                };

                let mut header_bytes = [0u8; RECORD_HEADER_LEN];
                header.encode(&mut header_bytes);

                self.writer.write(&header_bytes);
                self.writer.write(&self.signal_image);

                self.ticks[st] += 1;
                wrote = true;
            }

            self.base_tick += 1;
        }

        if wrote {
            self.writer.publish();

            if self.streaming.load(Ordering::Relaxed) > 0 {
                // Re-enter the dispatcher's event wait.
                let _ = self.waker.set_readiness(Ready::readable());
            }
        }
    }

    /// Applies queued parameter writes and halt requests. Returns true if
    /// any record was staged.
    fn drain_control(&mut self) -> bool {
        let mut wrote = false;

        while let Some(request) = self.control.pop() {
            match request {
                ControlRequest::ParamWrite { id, value } => {
                    let (offset, ok) = match self.params.get(id) {
                        Some(var) if var.byte_len() == value.len() => (var.offset, true),
                        _ => (0, false),
                    };

                    if !ok {
                        logging::warn!(self.log, "dropping malformed parameter write"; "id" => id);
                        continue;
                    }

                    self.param_image[offset..offset + value.len()].copy_from_slice(&value);
                    self.snapshot
                        .update(self.snapshot.signal_len + offset, &value);

                    let mut payload = Vec::with_capacity(4 + value.len());
                    let mut id_bytes = [0u8; 4];
                    LittleEndian::write_u32(&mut id_bytes, id as u32);
                    payload.extend_from_slice(&id_bytes);
                    payload.extend_from_slice(&value);

                    self.stage_record(RecordKind::ParamChange, &payload);
                    wrote = true;
                }
                ControlRequest::Halt => {
                    if !self.halted {
                        logging::warn!(self.log, "halt requested");
                        self.halted = true;
                        self.stage_record(RecordKind::Halt, &[]);
                        wrote = true;
                    }
                }
            }
        }

        wrote
    }

    fn stage_record(&mut self, kind: RecordKind, payload: &[u8]) {
        let header = RecordHeader {
            kind,
            sample_time: 0,
            tick: self.base_tick,
            len: payload.len() as u32,
        };

        let mut header_bytes = [0u8; RECORD_HEADER_LEN];
        header.encode(&mut header_bytes);

        self.writer.write(&header_bytes);
        self.writer.write(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DataType, Variable, VariableTable};
    use mio::Registration;

    #[test]
    fn test_record_header_roundtrip() {
        let header = RecordHeader {
            kind: RecordKind::Data,
            sample_time: 3,
            tick: 0x1122334455667788,
            len: 4096,
        };

        let mut bytes = [0u8; RECORD_HEADER_LEN];
        header.encode(&mut bytes);

        assert_eq!(RecordHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_record_header_rejects_unknown_kind() {
        let mut bytes = [0u8; RECORD_HEADER_LEN];
        bytes[0] = 42;

        assert!(RecordHeader::decode(&bytes).is_none());
    }

    #[test]
    fn test_control_queue_fifo_and_full() {
        let (sender, receiver) = control_queue(2);

        assert!(sender.push(ControlRequest::Halt).is_ok());
        assert!(sender
            .push(ControlRequest::ParamWrite {
                id: 1,
                value: vec![1]
            })
            .is_ok());

        // Capacity 2: the third push bounces.
        let bounced = sender.push(ControlRequest::Halt);
        assert_eq!(bounced, Err(ControlRequest::Halt));

        assert_eq!(receiver.pop(), Some(ControlRequest::Halt));
        assert_eq!(
            receiver.pop(),
            Some(ControlRequest::ParamWrite {
                id: 1,
                value: vec![1]
            })
        );
        assert_eq!(receiver.pop(), None);

        // Space again after consumption.
        assert!(sender.push(ControlRequest::Halt).is_ok());
    }

    #[test]
    fn test_control_queue_cross_thread() {
        let (sender, receiver) = control_queue(64);

        let consumer = std::thread::spawn(move || {
            let mut seen = 0usize;
            while seen < 100 {
                if let Some(ControlRequest::ParamWrite { id, .. }) = receiver.pop() {
                    assert_eq!(id, seen);
                    seen += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        for id in 0..100 {
            loop {
                match sender.push(ControlRequest::ParamWrite {
                    id,
                    value: vec![0],
                }) {
                    Ok(()) => break,
                    Err(_) => std::thread::yield_now(),
                }
            }
        }

        consumer.join().unwrap();
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = Snapshot::new(8, 4);

        snapshot.update(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        snapshot.update(8, &[9, 9, 9, 9]);

        let var = Variable {
            id: 0,
            path: "/x".into(),
            name: "x".into(),
            alias: None,
            data_type: DataType::U32,
            dims: vec![],
            offset: 4,
            sample_time: 0,
        };

        assert_eq!(snapshot.read_signal(&var), vec![5, 6, 7, 8]);

        let param = Variable {
            offset: 0,
            ..var.clone()
        };
        assert_eq!(snapshot.read_param(&param), vec![9, 9, 9, 9]);
    }

    struct CountingSource {
        len: usize,
    }

    impl ImageSource for CountingSource {
        fn image_len(&self) -> usize {
            self.len
        }

        fn sample(&mut self, tick: u64, dst: &mut [u8]) {
            for byte in dst.iter_mut() {
                *byte = tick as u8;
            }
        }
    }

    fn test_producer(
        ring: Arc<SampleRing>,
        decimations: Vec<u64>,
        params: Arc<ParameterTable>,
    ) -> (Producer, ControlSender, Arc<Snapshot>) {
        let (sender, receiver) = control_queue(16);
        let snapshot = Snapshot::new(4, params.image_len());
        let (_registration, readiness) = Registration::new2();

        let producer = Producer::new(
            ring,
            receiver,
            snapshot.clone(),
            Box::new(CountingSource { len: 4 }),
            params,
            decimations,
            Duration::from_millis(1),
            Arc::new(AtomicUsize::new(0)),
            readiness,
            Arc::new(AtomicBool::new(false)),
            rtkit::logging::discard_logger(),
        )
        .unwrap();

        (producer, sender, snapshot)
    }

    #[test]
    fn test_tick_emits_decimated_records() {
        let ring = SampleRing::new(4096);
        let params = Arc::new(VariableTable::empty());
        let (mut producer, _sender, _snapshot) = test_producer(ring.clone(), vec![1, 2], params);

        let mut rpos = ring.write_pos();

        for _ in 0..4 {
            producer.tick();
        }

        let mut records = Vec::new();
        while let Some(record) = read_record(&ring, &mut rpos) {
            records.push(record);
        }

        // Sample-time 0 fires every base tick, sample-time 1 every other.
        let st0: Vec<u64> = records
            .iter()
            .filter(|r| r.header.sample_time == 0)
            .map(|r| r.header.tick)
            .collect();
        let st1: Vec<u64> = records
            .iter()
            .filter(|r| r.header.sample_time == 1)
            .map(|r| r.header.tick)
            .collect();

        assert_eq!(st0, vec![0, 1, 2, 3]);
        assert_eq!(st1, vec![0, 1]);

        // Payload carries the base tick the image was sampled at.
        assert_eq!(records[0].payload, vec![0, 0, 0, 0]);
        assert!(records.iter().all(|r| r.header.kind == RecordKind::Data));
    }

    #[test]
    fn test_param_write_applied_and_pushed() {
        let ring = SampleRing::new(4096);
        let params = Arc::new(
            VariableTable::build(
                vec![Variable {
                    id: 0,
                    path: "/gain".into(),
                    name: "gain".into(),
                    alias: None,
                    data_type: DataType::U16,
                    dims: vec![],
                    offset: 0,
                    sample_time: 0,
                }],
                2,
            )
            .unwrap(),
        );

        let (mut producer, sender, snapshot) =
            test_producer(ring.clone(), vec![1], params.clone());

        sender
            .push(ControlRequest::ParamWrite {
                id: 0,
                value: vec![0x34, 0x12],
            })
            .unwrap();

        producer.tick();

        let mut cursor = 0u64;

        let first = read_record(&ring, &mut cursor).unwrap();
        assert_eq!(first.header.kind, RecordKind::ParamChange);
        assert_eq!(&first.payload[..4], &[0, 0, 0, 0]);
        assert_eq!(&first.payload[4..], &[0x34, 0x12]);

        let second = read_record(&ring, &mut cursor).unwrap();
        assert_eq!(second.header.kind, RecordKind::Data);

        assert_eq!(
            snapshot.read_param(params.get(0).unwrap()),
            vec![0x34, 0x12]
        );
    }

    #[test]
    fn test_halt_stops_data_records() {
        let ring = SampleRing::new(4096);
        let params = Arc::new(VariableTable::empty());
        let (mut producer, sender, _snapshot) = test_producer(ring.clone(), vec![1], params);

        producer.tick();
        sender.push(ControlRequest::Halt).unwrap();
        producer.tick();
        producer.tick();

        let mut cursor = 0u64;
        let mut kinds = Vec::new();
        while let Some(record) = read_record(&ring, &mut cursor) {
            kinds.push(record.header.kind);
        }

        assert_eq!(kinds, vec![RecordKind::Data, RecordKind::Halt]);
    }

    #[test]
    fn test_rejects_undersized_ring() {
        let ring = SampleRing::new(64);
        let params = Arc::new(VariableTable::empty());
        let (sender, receiver) = control_queue(4);
        let _ = sender;
        let snapshot = Snapshot::new(64, 0);
        let (_registration, readiness) = Registration::new2();

        let result = Producer::new(
            ring,
            receiver,
            snapshot,
            Box::new(CountingSource { len: 64 }),
            params,
            vec![1],
            Duration::from_millis(1),
            Arc::new(AtomicUsize::new(0)),
            readiness,
            Arc::new(AtomicBool::new(false)),
            rtkit::logging::discard_logger(),
        );

        assert!(result.is_err());
    }
}
