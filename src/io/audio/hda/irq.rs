// ============================================================================
// src/io/audio/hda/irq.rs - HDA Interrupt Thread
// ============================================================================
//!
//! コントローラごとの割り込み処理スレッド。
//!
//! 1 回の処理パスの順序:
//! 1. RIRB の新着応答をスナップショット
//! 2. STATESTS（コーデックの出現）を確認・クリアし、新しいコーデックを生成
//! 3. ストリーム割り込みのステータスをクリア
//! 4. スナップショットした応答をコーデックへ配送
//! 5. 保留中のコマンドで CORB を補充
//! 6. 進捗待ちのスレッドを起床
//!
//! 割り込みが来なくても `irq_poll_interval` ごとに 1 パス実行する。

use alloc::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, trace, warn};

use super::bus::IrqSignal;
use super::codec::CodecState;
use super::controller::HdaController;
use super::corb_rirb::RingResponse;
use super::regs::*;

/// Interrupt thread body; returns on `IrqSignal::Exit` or when every
/// sender is gone
pub(super) fn run(ctrl: Arc<HdaController>, rx: Receiver<IrqSignal>) {
    let poll = ctrl.config().irq_poll_interval;
    debug!("[HDA] {}: IRQ thread running", ctrl.name());

    loop {
        let signal = match rx.recv_timeout(poll) {
            Ok(signal) => signal,
            Err(RecvTimeoutError::Timeout) => IrqSignal::Wake,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if signal == IrqSignal::Exit {
            break;
        }

        // Coalesce everything raised while the previous pass ran
        let mut exit = false;
        for queued in rx.try_iter() {
            if queued == IrqSignal::Exit {
                exit = true;
            }
        }

        if signal == IrqSignal::Interrupt {
            ctrl.stats_ref().record_irq();
        }
        ctrl.process_irq();

        if exit {
            break;
        }
    }

    debug!("[HDA] {}: IRQ thread exiting", ctrl.name());
}

impl HdaController {
    /// One interrupt pass
    pub(super) fn process_irq(self: &Arc<Self>) {
        let engine = self.ring_engine();

        let snapped = engine.snapshot_responses();
        if snapped > 0 {
            trace!("[HDA] {}: {} new responses", self.name(), snapped);
        }

        let statests = self.bus().read16(REG_STATESTS) & STATESTS_MASK;
        if statests != 0 {
            self.bus().write16(REG_STATESTS, statests);
            self.handle_codec_presence(statests);
        }

        self.service_streams();

        for response in engine.drain_responses() {
            self.dispatch_response(response);
        }

        engine.refill();
        self.notify_progress();
    }

    /// Acknowledge per-stream interrupt status
    fn service_streams(&self) {
        let intsts = IntSts::from_bits_retain(self.bus().read32(REG_INTSTS));
        let sis = (intsts & IntSts::SIS_MASK).bits();
        if sis == 0 {
            return;
        }

        for stream in self.stream_pool().streams() {
            if sis & (1 << stream.index()) == 0 {
                continue;
            }
            let sts = stream.ack_status();
            if sts.intersects(SdSts::FIFOE | SdSts::DESE) {
                warn!("[HDA] Stream {}: error status {:?}", stream.id(), sts);
            } else {
                trace!("[HDA] Stream {}: status {:?}", stream.id(), sts);
            }
        }
    }

    fn dispatch_response(&self, response: RingResponse) {
        let addr = response.response().codec_addr();
        let Some(codec) = self.codec(addr) else {
            match response {
                RingResponse::Solicited(resp, job) => debug!(
                    "[HDA] Response {:#010x} for {} from absent codec {}, dropping",
                    resp.data, job.command, addr
                ),
                RingResponse::Unsolicited(resp) => {
                    debug!("[HDA] Unsolicited {:#010x} from absent codec {}", resp.data, addr)
                }
            }
            return;
        };

        match response {
            RingResponse::Solicited(resp, job) => codec.process_solicited(resp, job),
            RingResponse::Unsolicited(resp) => codec.process_unsolicited(resp),
        }

        if codec.state() == CodecState::FatalError {
            self.discard_codec(addr);
        }
    }
}
