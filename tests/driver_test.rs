// ============================================================================
// tests/driver_test.rs - コーデックドライバ統合テスト
// ============================================================================
//!
//! ドライバのバインド、ストリームのアクティブ化、フォーマット設定、
//! リングバッファ操作、非請求応答のルーティングを検証する。

mod common;

use std::sync::Arc;
use std::time::Duration;

use spin::Mutex;

use common::{Rig, TIMEOUT, wait_for};
use rany_hda::io::audio::driver::{CodecDriver, ConverterHooks, DriverStream, StreamContext, StreamHooks};
use rany_hda::io::audio::hda::proto::{
    RingBufferReply, RingBufferRequest, StreamClientReply, StreamClientRequest, error_from_status,
};
use rany_hda::io::audio::hda::stream::StreamType;
use rany_hda::io::audio::hda::{CodecResponse, LifecycleEvent, StreamFormat};
use rany_hda::io::audio::regs::{
    FUNC_GROUP_AUDIO, PARAM_FUNC_GROUP_TYPE, UNSOL_ENABLE, VERB_GET_PARAM, VERB_SET_CONV_FMT, VERB_SET_CONV_STREAM,
    VERB_SET_POWER, VERB_SET_UNSOL,
};
use rany_hda::ipc::Endpoint;
use rany_hda::{HdaError, HdaResult};

const DAC_NID: u16 = 2;

fn bind(rig: &Rig) -> Arc<CodecDriver> {
    let endpoint = rig.controller.codec_channel(0).unwrap();
    CodecDriver::bind(&rig.runtime, endpoint, rig.host(), "alc269").unwrap()
}

fn activate(driver: &CodecDriver, stream: &Arc<DriverStream>) {
    driver.activate_stream(stream).unwrap();
    assert!(driver.wait_until(|| stream.dma_assignment().is_some(), Some(TIMEOUT)));
}

fn set_format(client: &Endpoint, txn: u32, sample_rate: u32, bits: u8, channels: u8) -> HdaResult<Endpoint> {
    let req = StreamClientRequest::SetFormat {
        sample_rate,
        bits,
        channels,
    };
    client.write_bytes(&req.encode(txn)).unwrap();
    let msg = client.read_timeout(TIMEOUT).unwrap();
    match StreamClientReply::decode(&msg.bytes).unwrap() {
        (t, StreamClientReply::FormatSet) => {
            assert_eq!(t, txn);
            Ok(msg.capability.expect("format reply without ring buffer"))
        }
        (_, StreamClientReply::Error { status }) => Err(error_from_status(status)),
    }
}

fn rb_request(rb: &Endpoint, txn: u32, req: RingBufferRequest) -> RingBufferReply {
    rb.write_bytes(&req.encode(txn)).unwrap();
    let msg = rb.read_timeout(TIMEOUT).unwrap();
    let (reply_txn, reply) = RingBufferReply::decode(&msg.bytes).unwrap();
    assert_eq!(reply_txn, txn);
    reply
}

/// Records everything the core hands to the stream
#[derive(Default)]
struct RecordingHooks {
    unsolicited: Arc<Mutex<Vec<CodecResponse>>>,
    tag: Arc<Mutex<Option<u8>>>,
    deactivated: Arc<Mutex<usize>>,
}

impl StreamHooks for RecordingHooks {
    fn on_activate(&mut self, ctx: &mut StreamContext<'_>) -> HdaResult<()> {
        *self.tag.lock() = Some(ctx.alloc_unsol_tag()?);
        Ok(())
    }

    fn on_deactivate(&mut self) {
        *self.deactivated.lock() += 1;
    }

    fn on_unsolicited(&mut self, _ctx: &mut StreamContext<'_>, resp: CodecResponse) {
        self.unsolicited.lock().push(resp);
    }
}

/// Grabs a tag, then refuses to activate
struct FailingHooks;

impl StreamHooks for FailingHooks {
    fn on_activate(&mut self, ctx: &mut StreamContext<'_>) -> HdaResult<()> {
        ctx.alloc_unsol_tag()?;
        Err(HdaError::ResourceExhausted)
    }
}

// ============================================================================
// Driver-level requests
// ============================================================================

#[test]
fn test_driver_requests() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);
    assert!(driver.is_bound());

    let ids = driver.get_ids(TIMEOUT).unwrap();
    assert_eq!((ids.vendor_id, ids.device_id), (0x10EC, 0x0269));

    let resp = driver
        .send_command(1, VERB_GET_PARAM | PARAM_FUNC_GROUP_TYPE as u32, TIMEOUT)
        .unwrap();
    assert_eq!(resp.data & 0xFF, FUNC_GROUP_AUDIO as u32);

    driver.send_command_no_ack(DAC_NID, VERB_SET_POWER).unwrap();
    assert!(wait_for(|| rig
        .sim
        .commands_for(0)
        .iter()
        .any(|c| c.node_id() == DAC_NID as u8 && c.verb() == VERB_SET_POWER)));

    driver.shutdown();
    assert!(!driver.is_bound());
    assert_eq!(driver.get_ids(TIMEOUT).err(), Some(HdaError::BadState));
    rig.teardown();
}

// ============================================================================
// Stream lifecycle
// ============================================================================

#[test]
fn test_stream_activation_and_format() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);

    let stream = DriverStream::new(1, false, Box::new(ConverterHooks::new(DAC_NID).with_unsolicited()));
    activate(&driver, &stream);
    assert!(stream.is_active());
    assert_eq!(stream.unsol_tags(), vec![1]);
    assert_eq!(driver.free_unsol_tags(), 62);
    assert!(rig.recorder.contains(LifecycleEvent::DriverStreamActivated { stream_id: 1 }));
    assert!(rig.recorder.published().contains(&"alc269-output-stream001".to_string()));

    let dma = stream.dma_assignment().unwrap();
    // First output descriptor follows the four inputs
    assert_eq!(dma.stream_id, 5);
    assert_eq!(dma.tag, 1);

    let client = stream.get_channel().unwrap();
    assert_eq!(stream.get_channel().err(), Some(HdaError::AlreadyBound));
    let rb = set_format(&client, 10, 48000, 16, 2).unwrap();
    assert_eq!(stream.format(), Some(StreamFormat::new(48000, 16, 2)));

    let expect = [
        VERB_SET_POWER,
        VERB_SET_UNSOL | UNSOL_ENABLE | 1,
        VERB_SET_CONV_FMT | 0x0011,
        VERB_SET_CONV_STREAM | ((dma.tag as u32) << 4),
    ];
    assert!(wait_for(|| {
        let verbs: Vec<u32> = rig
            .sim
            .commands_for(0)
            .iter()
            .filter(|c| c.node_id() == DAC_NID as u8)
            .map(|c| c.verb())
            .collect();
        verbs == expect
    }));

    assert_eq!(
        rb_request(&rb, 1, RingBufferRequest::GetFifoDepth),
        RingBufferReply::FifoDepth { bytes: 0x100 }
    );
    assert_eq!(rb_request(&rb, 2, RingBufferRequest::Start), RingBufferReply::Started);
    let dma_stream = rig.controller.stream_pool().by_id(dma.stream_id).unwrap().clone();
    assert!(dma_stream.is_running());

    rig.sim.complete_buffer(dma_stream.index(), 0x200);
    assert_eq!(
        rb_request(&rb, 3, RingBufferRequest::GetPosition),
        RingBufferReply::Position { position: 0x200 }
    );
    assert_eq!(rb_request(&rb, 4, RingBufferRequest::Stop), RingBufferReply::Stopped);
    assert!(!dma_stream.is_running());

    driver.shutdown();
    rig.teardown();
}

#[test]
fn test_invalid_format_is_rejected() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);
    let stream = DriverStream::new(1, false, Box::new(ConverterHooks::new(DAC_NID)));
    activate(&driver, &stream);

    let client = stream.get_channel().unwrap();
    assert_eq!(set_format(&client, 1, 12345, 16, 2).err(), Some(HdaError::InvalidArgument));
    assert_eq!(set_format(&client, 2, 48000, 16, 0).err(), Some(HdaError::InvalidArgument));
    assert!(stream.format().is_none());

    // A valid request still goes through afterwards
    assert!(set_format(&client, 3, 44100, 24, 2).is_ok());
    driver.shutdown();
    rig.teardown();
}

#[test]
fn test_activate_rejects_bad_streams() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);

    let zero = DriverStream::new(0, false, Box::new(ConverterHooks::new(DAC_NID)));
    assert_eq!(driver.activate_stream(&zero).err(), Some(HdaError::InvalidArgument));

    let stream = DriverStream::new(4, true, Box::new(ConverterHooks::new(DAC_NID)));
    activate(&driver, &stream);
    assert_eq!(driver.activate_stream(&stream).err(), Some(HdaError::BadState));
    assert_eq!(driver.active_stream_count(), 1);

    assert_eq!(driver.deactivate_stream(9).err(), Some(HdaError::NotFound));
    driver.shutdown();

    let late = DriverStream::new(5, false, Box::new(ConverterHooks::new(DAC_NID)));
    assert_eq!(driver.activate_stream(&late).err(), Some(HdaError::BadState));
    rig.teardown();
}

#[test]
fn test_failed_activation_unwinds() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);

    let stream = DriverStream::new(3, false, Box::new(FailingHooks));
    assert_eq!(driver.activate_stream(&stream).err(), Some(HdaError::ResourceExhausted));
    assert!(!stream.is_active());
    assert!(stream.unsol_tags().is_empty());
    assert_eq!(driver.free_unsol_tags(), 63);
    assert_eq!(driver.active_stream_count(), 0);
    assert_eq!(stream.get_channel().err(), Some(HdaError::BadState));

    // No DMA stream was requested
    let pool = rig.controller.stream_pool();
    assert_eq!(pool.free_count(StreamType::Output), 4);
    driver.shutdown();
    rig.teardown();
}

#[test]
fn test_deactivate_releases_everything() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);
    let hooks = RecordingHooks::default();
    let deactivated = hooks.deactivated.clone();

    let stream = DriverStream::new(2, true, Box::new(hooks));
    activate(&driver, &stream);
    let client = stream.get_channel().unwrap();
    let pool = rig.controller.stream_pool();
    assert_eq!(pool.free_count(StreamType::Input), 3);

    driver.deactivate_stream(2).unwrap();
    assert!(!stream.is_active());
    assert!(stream.dma_assignment().is_none());
    assert_eq!(*deactivated.lock(), 1);
    assert_eq!(driver.free_unsol_tags(), 63);
    assert!(rig.recorder.contains(LifecycleEvent::DriverStreamDeactivated { stream_id: 2 }));
    assert!(!rig.recorder.published().contains(&"alc269-input-stream002".to_string()));

    assert!(wait_for(|| pool.free_count(StreamType::Input) == 4));
    assert!(wait_for(|| client.is_peer_closed()));
    assert_eq!(stream.get_channel().err(), Some(HdaError::BadState));

    // The same stream can come back
    activate(&driver, &stream);
    driver.shutdown();
    assert!(!stream.is_active());
    rig.teardown();
}

#[test]
fn test_deactivate_before_grant_returns_dma() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);
    let pool = rig.controller.stream_pool();
    let granted = || {
        rig.recorder
            .events()
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::DmaStreamAssigned { .. }))
            .count()
    };

    let stream = DriverStream::new(2, true, Box::new(ConverterHooks::new(DAC_NID)));
    driver.activate_stream(&stream).unwrap();
    driver.deactivate_stream(2).unwrap();
    assert!(stream.dma_assignment().is_none());

    // The grant may land after the stream is gone; it still goes back
    assert!(wait_for(|| granted() == 1));
    assert!(wait_for(|| pool.free_count(StreamType::Input) == 4));
    assert_eq!(driver.active_stream_count(), 0);

    driver.shutdown();
    rig.teardown();
}

#[test]
fn test_reactivation_keeps_one_grant() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);
    let pool = rig.controller.stream_pool();
    let granted = || {
        rig.recorder
            .events()
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::DmaStreamAssigned { .. }))
            .count()
    };

    let stream = DriverStream::new(2, true, Box::new(ConverterHooks::new(DAC_NID)));
    driver.activate_stream(&stream).unwrap();
    driver.deactivate_stream(2).unwrap();
    activate(&driver, &stream);

    assert!(wait_for(|| granted() == 2));
    assert!(wait_for(|| pool.free_count(StreamType::Input) == 3));
    let dma = stream.dma_assignment().unwrap();
    assert!(pool.by_id(dma.stream_id).is_some());

    driver.shutdown();
    assert!(wait_for(|| pool.free_count(StreamType::Input) == 4));
    rig.teardown();
}

/// Looks itself up in the driver while activating
struct LookupHooks {
    driver: std::sync::Weak<CodecDriver>,
    found: Arc<Mutex<Option<bool>>>,
}

impl StreamHooks for LookupHooks {
    fn on_activate(&mut self, ctx: &mut StreamContext<'_>) -> HdaResult<()> {
        let driver = self.driver.upgrade().ok_or(HdaError::BadState)?;
        *self.found.lock() = Some(driver.stream(ctx.stream_id()).is_some());
        Ok(())
    }
}

#[test]
fn test_hooks_may_query_active_set() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);
    let found = Arc::new(Mutex::new(None));
    let hooks = LookupHooks {
        driver: Arc::downgrade(&driver),
        found: found.clone(),
    };

    let stream = DriverStream::new(6, false, Box::new(hooks));
    activate(&driver, &stream);
    assert_eq!(*found.lock(), Some(true));
    assert_eq!(driver.active_stream_count(), 1);

    driver.shutdown();
    rig.teardown();
}

// ============================================================================
// Unsolicited responses
// ============================================================================

#[test]
fn test_unsolicited_routed_by_tag() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);

    let first = RecordingHooks::default();
    let (first_seen, first_tag) = (first.unsolicited.clone(), first.tag.clone());
    let second = RecordingHooks::default();
    let (second_seen, second_tag) = (second.unsolicited.clone(), second.tag.clone());

    let a = DriverStream::new(1, false, Box::new(first));
    let b = DriverStream::new(2, false, Box::new(second));
    activate(&driver, &a);
    activate(&driver, &b);
    let tag_a = first_tag.lock().unwrap();
    let tag_b = second_tag.lock().unwrap();
    assert_eq!((tag_a, tag_b), (1, 2));

    rig.sim.send_unsolicited(0, tag_b, 3, 0x42);
    assert!(wait_for(|| second_seen.lock().len() == 1));
    let resp = second_seen.lock()[0];
    assert_eq!(resp.unsol_tag(), tag_b);
    assert_eq!(resp.unsol_data(), 0x42);
    assert!(first_seen.lock().is_empty());

    // Unowned tags are dropped
    rig.sim.send_unsolicited(0, 40, 0, 1);
    rig.sim.send_unsolicited(0, tag_a, 0, 7);
    assert!(wait_for(|| first_seen.lock().len() == 1));
    assert_eq!(second_seen.lock().len(), 1);

    driver.shutdown();
    rig.teardown();
}

// ============================================================================
// Shutdown interplay
// ============================================================================

#[test]
fn test_controller_shutdown_drops_driver_streams() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);
    let a = DriverStream::new(1, false, Box::new(ConverterHooks::new(DAC_NID)));
    let b = DriverStream::new(2, true, Box::new(ConverterHooks::new(3)));
    activate(&driver, &a);
    activate(&driver, &b);

    rig.controller.shutdown();
    assert!(driver.wait_until(|| driver.active_stream_count() == 0, Some(TIMEOUT)));
    assert!(wait_for(|| !driver.is_bound()));
    assert!(!a.is_active() && !b.is_active());
    assert!(rig.recorder.contains(LifecycleEvent::DriverStreamDeactivated { stream_id: 1 }));
    assert!(rig.recorder.contains(LifecycleEvent::DriverStreamDeactivated { stream_id: 2 }));

    driver.shutdown();
    rig.runtime.shutdown();
}

#[test]
fn test_driver_request_times_out_when_codec_stalls() {
    let rig = Rig::with_codec();
    let driver = bind(&rig);

    rig.sim.hold_commands();
    let verb = VERB_GET_PARAM | PARAM_FUNC_GROUP_TYPE as u32;
    assert_eq!(
        driver.send_command(1, verb, Duration::from_millis(50)).err(),
        Some(HdaError::Timeout)
    );
    rig.sim.release_commands();

    driver.shutdown();
    rig.teardown();
}
