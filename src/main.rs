// ============================================================================
// src/main.rs - HDA Controller Simulation Demo
// ============================================================================
//!
//! シミュレートしたコントローラ上でコア全体を一巡させる。
//!
//! 1. ディスパッチランタイムとコントローラの起動
//! 2. コーデックの検出とドライバのバインド
//! 3. 出力ストリームのアクティブ化とフォーマット設定
//! 4. リングバッファの開始 / 位置取得 / 停止
//! 5. 依存順序に従ったシャットダウン

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use rany_hda::io::audio::driver::{CodecDriver, ConverterHooks, DriverStream};
use rany_hda::io::audio::hda::device::DeviceHost;
use rany_hda::io::audio::hda::proto::{RingBufferReply, RingBufferRequest, StreamClientReply, StreamClientRequest};
use rany_hda::io::audio::hda::{HdaBus, HdaController, NullDeviceHost};
use rany_hda::ipc::{DispatchRuntime, Endpoint};
use rany_hda::test::{SimCodec, SimHda};
use rany_hda::{ControllerConfig, HdaError, HdaResult, RuntimeConfig};

const CODEC_ADDR: u8 = 0;
const DAC_NID: u16 = 2;
const OUTPUT_STREAM_ID: u32 = 1;
const TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    if rany_hda::io::log::init().is_err() {
        eprintln!("logger already installed");
    }

    match run() {
        Ok(()) => {
            info!("[DEMO] done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("[DEMO] failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> HdaResult<()> {
    let runtime = DispatchRuntime::new(RuntimeConfig::default())?;
    let host: Arc<dyn DeviceHost> = Arc::new(NullDeviceHost);

    let sim = SimHda::builder()
        .streams(2, 2, 0)
        .codec(CODEC_ADDR, SimCodec::new(0x10EC_0269))
        .build();
    let bus: Arc<dyn HdaBus> = sim.clone();

    info!("[DEMO] starting controller");
    let controller = HdaController::new(bus, runtime.clone(), host.clone(), ControllerConfig::default())?;
    let codec = controller.wait_for_codec(CODEC_ADDR, TIMEOUT)?;
    info!("[DEMO] codec {} is {}", codec.addr(), codec.identity());

    let result = exercise(&controller, &runtime, host);

    info!("[DEMO] shutting down");
    controller.shutdown();
    runtime.shutdown();
    info!("[DEMO] {} commands reached the codec", sim.commands().len());
    result
}

fn exercise(controller: &Arc<HdaController>, runtime: &Arc<DispatchRuntime>, host: Arc<dyn DeviceHost>) -> HdaResult<()> {
    let endpoint = controller.codec_channel(CODEC_ADDR)?;
    let driver = CodecDriver::bind(runtime, endpoint, host, "alc269")?;

    let ids = driver.get_ids(TIMEOUT)?;
    info!("[DEMO] driver sees {:04x}:{:04x}", ids.vendor_id, ids.device_id);

    let stream = DriverStream::new(OUTPUT_STREAM_ID, false, Box::new(ConverterHooks::new(DAC_NID)));
    driver.activate_stream(&stream)?;
    if !driver.wait_until(|| stream.dma_assignment().is_some(), Some(TIMEOUT)) {
        return Err(HdaError::Timeout);
    }
    info!("[DEMO] stream {} got {:?}", stream.id(), stream.dma_assignment());

    let client = stream.get_channel()?;
    let ring_buffer = set_format(&client)?;
    drive_ring_buffer(&ring_buffer)?;

    driver.deactivate_stream(OUTPUT_STREAM_ID)?;
    driver.shutdown();
    Ok(())
}

fn set_format(client: &Endpoint) -> HdaResult<Endpoint> {
    let req = StreamClientRequest::SetFormat {
        sample_rate: 48000,
        bits: 16,
        channels: 2,
    };
    client.write_bytes(&req.encode(1))?;
    let msg = client.read_timeout(TIMEOUT)?;
    match StreamClientReply::decode(&msg.bytes)? {
        (_, StreamClientReply::FormatSet) => msg.capability.ok_or(HdaError::BadState),
        (_, StreamClientReply::Error { status }) => Err(rany_hda::io::audio::hda::proto::error_from_status(status)),
    }
}

fn drive_ring_buffer(rb: &Endpoint) -> HdaResult<()> {
    for (txn, req) in [
        RingBufferRequest::GetFifoDepth,
        RingBufferRequest::Start,
        RingBufferRequest::GetPosition,
        RingBufferRequest::Stop,
    ]
    .into_iter()
    .enumerate()
    {
        rb.write_bytes(&req.encode(txn as u32))?;
        let msg = rb.read_timeout(TIMEOUT)?;
        let (_, reply) = RingBufferReply::decode(&msg.bytes)?;
        info!("[DEMO] ring buffer {:?} -> {:?}", req, reply);
        if let RingBufferReply::Error { status } = reply {
            return Err(rany_hda::io::audio::hda::proto::error_from_status(status));
        }
    }
    Ok(())
}
