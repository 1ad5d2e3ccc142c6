//! Call manager: owns the active calls and drives each one's pipeline.
//!
//! ## Per-call state machine
//! Dialing → Handshaking → Active → Terminating → Ended.
//!
//! Transport-level dial success does not mean the remote accepted, so every
//! call starts with an explicit exchange of empty handshake frames. Only
//! after the exchange does the call register, set `CALL_CONNECTED`, and
//! spawn its four tasks:
//! - receive: stream → speaker buffer
//! - playback: speaker buffer → device (engine)
//! - capture: device → mic buffer (engine)
//! - send: mic buffer → stream
//!
//! The first task to finish (or an error report, or a hangup) ends the call:
//! the call token is cancelled, the send half is closed after a best-effort
//! drain, and the supervisor joins all four tasks within a bounded window.
//!
//! ## Simultaneous calls
//! Single-active profile: an incoming connection is dropped while any call
//! is registered, and an outgoing call that completes its handshake second
//! is hung up on the spot. The audio devices therefore always belong to at
//! most one call.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;

use intercom_audio::{AudioSink, AudioSource, FrameBuffer};
use intercom_proto::{CallStream, Dialer, FrameReceiver, FrameSender, WireError};
use intercom_types::{AudioFrame, FRAME_SAMPLES};

use crate::call::{Call, CallId, CallStatus, Direction};
use crate::error::CallError;
use crate::status::{StationFlags, StationStatus};

/// Timing knobs for the call state machine. Tests shorten these.
#[derive(Debug, Clone)]
pub struct CallTiming {
    /// How long an incoming call waits on the accept gate under
    /// do-not-disturb. Timeout counts as reject.
    pub accept: Duration,
    /// Outgoing handshake bound. Must outlast the remote's accept gate so a
    /// slow human accept does not race the caller's timeout.
    pub handshake: Duration,
    /// Incoming-side bound on reading the caller's handshake frame.
    pub handshake_reply: Duration,
    /// Bounded wait on an empty audio buffer before declaring the producer
    /// dead.
    pub stall: Duration,
    /// How long a task waits to hand its error to the supervisor before
    /// dropping it.
    pub error_report: Duration,
    /// How long teardown waits for the four tasks to quiesce.
    pub quiesce: Duration,
}

impl Default for CallTiming {
    fn default() -> Self {
        Self {
            accept: Duration::from_secs(20),
            handshake: Duration::from_secs(25),
            handshake_reply: Duration::from_secs(5),
            stall: Duration::from_secs(5),
            error_report: Duration::from_secs(5),
            quiesce: Duration::from_secs(5),
        }
    }
}

/// Speaker/mic queue depth in frames.
const BUFFER_CAPACITY_FRAMES: usize = 4;

#[derive(Default)]
struct Registry {
    /// Calls still dialing, handshaking, or waiting on the accept gate.
    pending: HashMap<CallId, Arc<Call>>,
    /// Calls past the handshake, audio flowing.
    active: HashMap<CallId, Arc<Call>>,
}

pub struct CallManager {
    status: Arc<StationStatus>,
    playback: Arc<dyn AudioSink>,
    capture: Arc<dyn AudioSource>,
    dialer: Arc<dyn Dialer>,
    timing: CallTiming,
    calls: Mutex<Registry>,
    /// Single-slot rendezvous between the inbound path and the buttons.
    accept_gate: Mutex<Option<oneshot::Sender<bool>>>,
    fatal: Option<mpsc::Sender<CallError>>,
}

impl CallManager {
    pub fn new(
        status: Arc<StationStatus>,
        playback: Arc<dyn AudioSink>,
        capture: Arc<dyn AudioSource>,
        dialer: Arc<dyn Dialer>,
        timing: CallTiming,
        fatal: Option<mpsc::Sender<CallError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            status,
            playback,
            capture,
            dialer,
            timing,
            calls: Mutex::new(Registry::default()),
            accept_gate: Mutex::new(None),
            fatal,
        })
    }

    /// Any call still pending or active.
    pub fn has_calls(&self) -> bool {
        let g = self.calls.lock().unwrap();
        g.pending
            .values()
            .chain(g.active.values())
            .any(|c| c.is_live())
    }

    /// Dial every peer; returns immediately.
    pub fn call_all(self: Arc<Self>, peers: &[SocketAddr]) {
        if peers.is_empty() {
            tracing::info!("no peers configured; nothing to call");
            return;
        }
        for peer in peers {
            let manager = self.clone();
            let peer = *peer;
            tokio::spawn(async move {
                manager.outgoing_call(peer).await;
            });
        }
    }

    /// Trigger hangup on every current call. The calls unregister themselves
    /// as their tasks quiesce.
    pub fn hangup_all(&self) {
        let calls: Vec<Arc<Call>> = {
            let g = self.calls.lock().unwrap();
            g.pending.values().chain(g.active.values()).cloned().collect()
        };
        if calls.is_empty() {
            return;
        }
        tracing::info!(count = calls.len(), "hanging up all calls");
        for call in &calls {
            call.hangup();
        }
    }

    /// Deliver an accept decision to a waiting incoming call; no-op if none
    /// is waiting.
    pub fn accept(&self) {
        self.decide(true);
    }

    /// Deliver a reject decision to a waiting incoming call; no-op if none
    /// is waiting.
    pub fn reject(&self) {
        self.decide(false);
    }

    fn decide(&self, accepted: bool) {
        let Some(gate) = self.accept_gate.lock().unwrap().take() else {
            tracing::debug!("no incoming call awaiting a decision");
            return;
        };
        let _ = gate.send(accepted);
    }

    /// Entry point for inbound calls from the signaling server.
    pub async fn serve(
        self: Arc<Self>,
        stream: Box<dyn CallStream>,
        from: String,
        to: String,
    ) -> Result<(), CallError> {
        tracing::info!(from = %from, to = %to, "incoming call");
        if self.has_calls() {
            // Single-active: drop without a handshake reply; the caller
            // observes end-of-stream.
            tracing::info!(from = %from, "busy; auto-rejecting incoming call");
            return Ok(());
        }

        let call = Call::new(from, Direction::Incoming);
        self.register_pending(&call);
        self.status.set(StationFlags::INCOMING_CALL);
        let result = self.run_incoming(&call, stream).await;
        self.unregister(&call);
        self.settle_ring_flags();
        self.finish_call(&call, &result);
        result
    }

    async fn outgoing_call(self: Arc<Self>, peer: SocketAddr) {
        let call = Call::new(peer.to_string(), Direction::Outgoing);
        self.register_pending(&call);
        self.status.set(StationFlags::OUTGOING_CALL);
        tracing::info!(call_id = %call.id(), peer = %peer, "dialing");
        let result = self.run_outgoing(&call, peer).await;
        self.unregister(&call);
        self.settle_ring_flags();
        self.finish_call(&call, &result);
    }

    async fn run_outgoing(&self, call: &Arc<Call>, peer: SocketAddr) -> Result<(), CallError> {
        // Dialing. An unreachable peer is a warning, not a station fault:
        // the call just ends.
        let stream = tokio::select! {
            _ = call.cancelled() => return Err(CallError::Cancelled),
            res = self.dialer.dial(peer) => match res {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(call_id = %call.id(), peer = %peer, error = %err, "unable to dial");
                    return Ok(());
                }
            },
        };

        // Handshaking: one empty frame out, one frame back within the bound.
        let (mut sender, mut receiver) = stream.split();
        sender
            .send(&AudioFrame::handshake())
            .await
            .map_err(CallError::from)?;
        let reply = tokio::select! {
            _ = call.cancelled() => return Err(CallError::Cancelled),
            res = timeout(self.timing.handshake, receiver.recv()) => res,
        };
        match reply {
            Err(_) => return Err(CallError::HandshakeTimeout(self.timing.handshake)),
            Ok(Err(err)) => return Err(err.into()),
            // Never replied, then half-closed: the remote rejected us.
            Ok(Ok(None)) => return Err(CallError::PeerRejected),
            Ok(Ok(Some(_))) => {}
        }

        self.activate(call, sender, receiver).await
    }

    async fn run_incoming(
        &self,
        call: &Arc<Call>,
        stream: Box<dyn CallStream>,
    ) -> Result<(), CallError> {
        if self.status.has(StationFlags::DO_NOT_DISTURB) {
            if !self.await_accept(call).await? {
                tracing::info!(call_id = %call.id(), peer = %call.peer(), "call rejected");
                return Ok(());
            }
        }

        // Consume the caller's handshake frame, then complete the exchange.
        let (mut sender, mut receiver) = stream.split();
        let hello = tokio::select! {
            _ = call.cancelled() => return Err(CallError::Cancelled),
            res = timeout(self.timing.handshake_reply, receiver.recv()) => res,
        };
        match hello {
            Err(_) => return Err(CallError::HandshakeTimeout(self.timing.handshake_reply)),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(None)) => return Err(CallError::TransportClosed),
            Ok(Ok(Some(_))) => {}
        }
        sender
            .send(&AudioFrame::handshake())
            .await
            .map_err(CallError::from)?;

        self.activate(call, sender, receiver).await
    }

    /// Block on the accept gate until the user decides or the window runs
    /// out. Timeout counts as reject.
    async fn await_accept(&self, call: &Arc<Call>) -> Result<bool, CallError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut gate = self.accept_gate.lock().unwrap();
            if gate.is_some() {
                // The slot is single-occupancy: a second simultaneous
                // incoming call is rejected outright.
                return Ok(false);
            }
            *gate = Some(tx);
        }

        let decision = tokio::select! {
            _ = call.cancelled() => Err(CallError::Cancelled),
            res = timeout(self.timing.accept, rx) => match res {
                Err(_) => Err(CallError::AcceptTimeout(self.timing.accept)),
                Ok(Ok(accepted)) => Ok(accepted),
                Ok(Err(_)) => Ok(false),
            },
        };
        // Reclaim the slot on the timeout/cancel paths.
        self.accept_gate.lock().unwrap().take();
        decision
    }

    /// Register the call as the station's active call and run its pipeline
    /// to completion.
    async fn activate(
        &self,
        call: &Arc<Call>,
        sender: Box<dyn FrameSender>,
        receiver: Box<dyn FrameReceiver>,
    ) -> Result<(), CallError> {
        if !self.claim_active(call) {
            tracing::info!(
                call_id = %call.id(),
                peer = %call.peer(),
                "another call is already active; hanging up this one"
            );
            return Ok(());
        }
        self.status.set(StationFlags::CALL_CONNECTED);
        tracing::info!(
            call_id = %call.id(),
            peer = %call.peer(),
            direction = %call.direction(),
            "call active"
        );

        let result = self.run_pipeline(call, sender, receiver).await;
        self.release_active(call);
        result
    }

    /// Spawn the four tasks, wait for the first end event, then tear down.
    async fn run_pipeline(
        &self,
        call: &Arc<Call>,
        mut sender: Box<dyn FrameSender>,
        mut receiver: Box<dyn FrameReceiver>,
    ) -> Result<(), CallError> {
        let speaker = Arc::new(FrameBuffer::with_stall(
            BUFFER_CAPACITY_FRAMES,
            self.timing.stall,
        ));
        let mic = Arc::new(FrameBuffer::with_stall(
            BUFFER_CAPACITY_FRAMES,
            self.timing.stall,
        ));
        let (err_tx, mut err_rx) = mpsc::channel::<CallError>(1);
        let token = call.cancel_token();
        let report = self.timing.error_report;
        let mut tasks: JoinSet<()> = JoinSet::new();

        // receive: stream -> speaker buffer
        {
            let speaker = speaker.clone();
            let token = token.clone();
            let err_tx = err_tx.clone();
            tasks.spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = token.cancelled() => break,
                        res = receiver.recv() => match res {
                            Ok(Some(frame)) => frame,
                            Ok(None) => break, // peer half-closed
                            Err(err) => {
                                report_error(&err_tx, err.into(), report).await;
                                break;
                            }
                        },
                    };
                    if frame.is_handshake() {
                        continue;
                    }
                    let pushed = tokio::select! {
                        _ = token.cancelled() => break,
                        res = speaker.push(frame) => res,
                    };
                    if pushed.is_err() {
                        break;
                    }
                }
                speaker.close();
            });
        }

        // playback: speaker buffer -> device
        {
            let playback = self.playback.clone();
            let speaker = speaker.clone();
            let token = token.clone();
            let err_tx = err_tx.clone();
            tasks.spawn(async move {
                if let Err(err) = playback.run_playback(speaker, token.child_token()).await {
                    report_error(&err_tx, err.into(), report).await;
                }
            });
        }

        // capture: device -> mic buffer
        {
            let capture = self.capture.clone();
            let mic = mic.clone();
            let token = token.clone();
            let err_tx = err_tx.clone();
            tasks.spawn(async move {
                if let Err(err) = capture.run_capture(mic, token.child_token()).await {
                    report_error(&err_tx, err.into(), report).await;
                }
            });
        }

        // send: mic buffer -> stream
        {
            let mic = mic.clone();
            let token = token.clone();
            let err_tx = err_tx.clone();
            tasks.spawn(async move {
                let mut scratch = vec![0.0f32; FRAME_SAMPLES];
                loop {
                    let pulled = tokio::select! {
                        _ = token.cancelled() => break,
                        pulled = mic.pull(&mut scratch) => pulled,
                    };
                    if pulled.samples > 0 {
                        let frame = AudioFrame::new(scratch[..pulled.samples].to_vec());
                        if let Err(err) = sender.send(&frame).await {
                            if !matches!(err, WireError::Closed) {
                                report_error(&err_tx, err.into(), report).await;
                            }
                            break;
                        }
                    }
                    if pulled.end {
                        break;
                    }
                }
                // Best-effort drain of queued mic audio, then half-close so
                // the peer observes end-of-stream.
                loop {
                    let pulled = mic.pull_now(&mut scratch);
                    if pulled.samples == 0 {
                        break;
                    }
                    let frame = AudioFrame::new(scratch[..pulled.samples].to_vec());
                    if sender.send(&frame).await.is_err() {
                        break;
                    }
                }
                sender.close_send().await;
            });
        }
        drop(err_tx);

        // Active: wait for the first end event. Local hangup, a task
        // finishing for any reason, or an error report all qualify.
        let mut first_error = tokio::select! {
            _ = token.cancelled() => None,
            err = err_rx.recv() => err,
            _ = tasks.join_next() => None,
        };

        // Terminating: whoever won, everyone stops now.
        let supervisor_ended = call.advance(CallStatus::Terminating);
        token.cancel();
        speaker.close();
        mic.close();
        let quiesced = timeout(self.timing.quiesce, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !quiesced {
            tracing::warn!(call_id = %call.id(), "call tasks failed to quiesce in time; aborting");
            tasks.abort_all();
        }
        if first_error.is_none() {
            first_error = err_rx.try_recv().ok();
        }

        // Local hangup wins the tie-break over a racing transport error.
        if !supervisor_ended {
            tracing::info!(call_id = %call.id(), "call ended by user");
            return Ok(());
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn register_pending(&self, call: &Arc<Call>) {
        let prev = self
            .calls
            .lock()
            .unwrap()
            .pending
            .insert(call.id(), call.clone());
        if prev.is_some() {
            self.report_fatal(CallError::InternalInvariant(format!(
                "duplicate call id {}",
                call.id()
            )));
        }
    }

    /// Promote the call to active iff no other call holds the devices.
    fn claim_active(&self, call: &Arc<Call>) -> bool {
        let mut g = self.calls.lock().unwrap();
        if !g.active.is_empty() {
            return false;
        }
        g.pending.remove(&call.id());
        g.active.insert(call.id(), call.clone());
        call.advance(CallStatus::Active);
        true
    }

    fn release_active(&self, call: &Arc<Call>) {
        let empty = {
            let mut g = self.calls.lock().unwrap();
            g.active.remove(&call.id());
            g.active.is_empty()
        };
        if empty {
            self.status.clear(StationFlags::CALL_CONNECTED);
        }
    }

    fn unregister(&self, call: &Arc<Call>) {
        let mut g = self.calls.lock().unwrap();
        g.pending.remove(&call.id());
        g.active.remove(&call.id());
    }

    /// Drop the ringing flags that no longer have a pending call behind
    /// them.
    fn settle_ring_flags(&self) {
        let (incoming, outgoing) = {
            let g = self.calls.lock().unwrap();
            let incoming = g
                .pending
                .values()
                .any(|c| c.direction() == Direction::Incoming);
            let outgoing = g
                .pending
                .values()
                .any(|c| c.direction() == Direction::Outgoing);
            (incoming, outgoing)
        };
        if !incoming {
            self.status.clear(StationFlags::INCOMING_CALL);
        }
        if !outgoing {
            self.status.clear(StationFlags::OUTGOING_CALL);
        }
    }

    fn finish_call(&self, call: &Arc<Call>, result: &Result<(), CallError>) {
        match result {
            Ok(()) => {
                tracing::info!(call_id = %call.id(), peer = %call.peer(), "call ended");
            }
            Err(err) if err.is_benign() => {
                tracing::info!(call_id = %call.id(), peer = %call.peer(), reason = %err, "call ended");
            }
            Err(err) => {
                tracing::warn!(call_id = %call.id(), peer = %call.peer(), error = %err, "call failed");
                if err.is_fatal_to_station() {
                    self.report_fatal(CallError::InternalInvariant(err.to_string()));
                } else if matches!(err, CallError::DeviceUnavailable(_)) {
                    // A missing device stays broken until someone fixes it.
                    self.status.set(StationFlags::ERROR);
                } else {
                    self.status.clone().flash_error();
                }
            }
        }
    }

    fn report_fatal(&self, err: CallError) {
        tracing::error!(error = %err, "fatal station error");
        if let Some(fatal) = &self.fatal {
            let _ = fatal.try_send(err);
        }
    }
}

/// Hand a task's error to the supervisor, bounded; an unclaimed error is
/// logged and dropped (the cancel token still ends the call).
async fn report_error(err_tx: &mpsc::Sender<CallError>, err: CallError, bound: Duration) {
    let description = err.to_string();
    match timeout(bound, err_tx.send(err)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::debug!(error = %description, "call already tearing down"),
        Err(_) => tracing::warn!(error = %description, "no reader for call error; dropping"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use intercom_audio::AudioError;
    use intercom_proto::memory::{self, MemoryCallStream};
    use tokio_util::sync::CancellationToken;

    use crate::io::OutputSink;

    fn test_timing() -> CallTiming {
        CallTiming {
            accept: Duration::from_millis(400),
            handshake: Duration::from_millis(800),
            handshake_reply: Duration::from_millis(500),
            stall: Duration::from_millis(200),
            error_report: Duration::from_millis(200),
            quiesce: Duration::from_secs(2),
        }
    }

    struct SilentSink;
    impl OutputSink for SilentSink {
        fn update(&self, _status: StationFlags) {}
    }

    /// Capture engine that emits a fixed script of frames, then idles until
    /// cancelled.
    struct ScriptedCapture {
        frames: Mutex<Vec<AudioFrame>>,
    }

    impl ScriptedCapture {
        fn new(frames: Vec<AudioFrame>) -> Self {
            Self {
                frames: Mutex::new(frames),
            }
        }
    }

    #[async_trait]
    impl AudioSource for ScriptedCapture {
        async fn run_capture(
            &self,
            buffer: Arc<FrameBuffer>,
            cancel: CancellationToken,
        ) -> Result<(), AudioError> {
            let frames: Vec<AudioFrame> = self.frames.lock().unwrap().drain(..).collect();
            for frame in frames {
                if cancel.is_cancelled() {
                    break;
                }
                let _ = buffer.push(frame).await;
            }
            cancel.cancelled().await;
            buffer.close();
            Ok(())
        }
    }

    /// Playback engine that records everything pulled from the speaker
    /// buffer.
    #[derive(Default)]
    struct RecordingPlayback {
        heard: Arc<Mutex<Vec<f32>>>,
    }

    #[async_trait]
    impl AudioSink for RecordingPlayback {
        async fn run_playback(
            &self,
            buffer: Arc<FrameBuffer>,
            cancel: CancellationToken,
        ) -> Result<(), AudioError> {
            let mut scratch = vec![0.0f32; FRAME_SAMPLES];
            loop {
                let pulled = tokio::select! {
                    _ = cancel.cancelled() => break,
                    pulled = buffer.pull(&mut scratch) => pulled,
                };
                self.heard
                    .lock()
                    .unwrap()
                    .extend_from_slice(&scratch[..pulled.samples]);
                if pulled.end {
                    break;
                }
            }
            buffer.close();
            Ok(())
        }
    }

    /// Dialer that manufactures an in-memory pair and hands the far end to
    /// the test's fake remote station.
    struct TestDialer {
        remote_tx: mpsc::UnboundedSender<MemoryCallStream>,
    }

    #[async_trait]
    impl Dialer for TestDialer {
        async fn dial(&self, _peer: SocketAddr) -> Result<Box<dyn CallStream>, WireError> {
            let (near, far) = memory::pair();
            self.remote_tx
                .send(far)
                .map_err(|_| WireError::Closed)?;
            Ok(Box::new(near))
        }
    }

    struct Fixture {
        manager: Arc<CallManager>,
        status: Arc<StationStatus>,
        heard: Arc<Mutex<Vec<f32>>>,
        remote_rx: mpsc::UnboundedReceiver<MemoryCallStream>,
    }

    fn fixture(mic_script: Vec<AudioFrame>) -> Fixture {
        let status = StationStatus::new(Arc::new(SilentSink));
        let playback = Arc::new(RecordingPlayback::default());
        let heard = playback.heard.clone();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let manager = CallManager::new(
            status.clone(),
            playback,
            Arc::new(ScriptedCapture::new(mic_script)),
            Arc::new(TestDialer { remote_tx }),
            test_timing(),
            None,
        );
        Fixture {
            manager,
            status,
            heard,
            remote_rx,
        }
    }

    fn peer_addr() -> SocketAddr {
        "192.168.0.203:20000".parse().unwrap()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn outgoing_call_connects_streams_audio_and_hangs_up() {
        let mut fx = fixture(vec![AudioFrame::new(vec![0.5; FRAME_SAMPLES])]);
        fx.manager.clone().call_all(&[peer_addr()]);

        // Fake remote: accept the handshake, send one frame of audio.
        let far = fx.remote_rx.recv().await.unwrap();
        let (mut far_tx, mut far_rx) = Box::new(far).split();
        assert!(far_rx.recv().await.unwrap().unwrap().is_handshake());
        far_tx.send(&AudioFrame::handshake()).await.unwrap();
        far_tx
            .send(&AudioFrame::new(vec![0.25; FRAME_SAMPLES]))
            .await
            .unwrap();

        let manager = fx.manager.clone();
        let status = fx.status.clone();
        assert!(
            wait_until(
                || status.has(StationFlags::CALL_CONNECTED),
                Duration::from_secs(2)
            )
            .await
        );
        assert!(manager.has_calls());

        // The remote hears the scripted mic frame.
        let mut remote_heard = Vec::new();
        while remote_heard.len() < FRAME_SAMPLES {
            match far_rx.recv().await.unwrap() {
                Some(frame) => remote_heard.extend_from_slice(frame.samples()),
                None => break,
            }
        }
        assert_eq!(remote_heard, vec![0.5; FRAME_SAMPLES]);

        // And the frame the remote sent reaches the speaker side.
        let heard = fx.heard.clone();
        assert!(
            wait_until(
                || heard.lock().unwrap().len() >= FRAME_SAMPLES,
                Duration::from_secs(2)
            )
            .await
        );

        manager.hangup_all();
        assert!(
            wait_until(|| !manager.has_calls(), Duration::from_secs(6)).await,
            "tasks must quiesce within the bounded window"
        );
        assert!(!fx.status.has(StationFlags::CALL_CONNECTED));
        assert!(!fx.status.has(StationFlags::OUTGOING_CALL));
        assert_eq!(&fx.heard.lock().unwrap()[..FRAME_SAMPLES], &[0.25; FRAME_SAMPLES][..]);
    }

    #[tokio::test]
    async fn remote_that_never_replies_times_out_silently() {
        let mut fx = fixture(Vec::new());
        fx.manager.clone().call_all(&[peer_addr()]);

        // Fake remote keeps the stream open but never completes the
        // handshake.
        let _far = fx.remote_rx.recv().await.unwrap();

        let manager = fx.manager.clone();
        assert!(wait_until(|| !manager.has_calls(), Duration::from_secs(3)).await);
        assert!(!fx.status.has(StationFlags::OUTGOING_CALL));
        assert!(!fx.status.has(StationFlags::CALL_CONNECTED));
    }

    #[tokio::test]
    async fn remote_half_close_during_handshake_reads_as_reject() {
        let mut fx = fixture(Vec::new());
        fx.manager.clone().call_all(&[peer_addr()]);

        let far = fx.remote_rx.recv().await.unwrap();
        let (mut far_tx, _far_rx) = Box::new(far).split();
        far_tx.close_send().await;

        let manager = fx.manager.clone();
        assert!(wait_until(|| !manager.has_calls(), Duration::from_secs(3)).await);
        // A reject never lights the error lamp or touches do-not-disturb.
        assert_eq!(fx.status.snapshot(), StationFlags::empty());
    }

    #[tokio::test]
    async fn incoming_call_is_auto_answered_without_do_not_disturb() {
        let fx = fixture(Vec::new());
        let (near, far) = memory::pair();
        let manager = fx.manager.clone();
        let serve = tokio::spawn(manager.serve(
            Box::new(near),
            "192.168.0.201:9999".into(),
            "192.168.0.202:20000".into(),
        ));

        let (mut far_tx, mut far_rx) = Box::new(far).split();
        far_tx.send(&AudioFrame::handshake()).await.unwrap();
        let reply = far_rx.recv().await.unwrap();
        assert!(reply.unwrap().is_handshake());
        let status = fx.status.clone();
        assert!(
            wait_until(
                || status.has(StationFlags::CALL_CONNECTED),
                Duration::from_secs(1)
            )
            .await
        );

        far_tx.close_send().await;
        serve.await.unwrap().unwrap();
        assert!(!fx.manager.has_calls());
        assert_eq!(fx.status.snapshot(), StationFlags::empty());
    }

    #[tokio::test]
    async fn do_not_disturb_rejects_on_gate_timeout() {
        let fx = fixture(Vec::new());
        fx.status.set(StationFlags::DO_NOT_DISTURB);

        let (near, far) = memory::pair();
        let manager = fx.manager.clone();
        let serve = tokio::spawn(manager.serve(Box::new(near), "caller".into(), "callee".into()));

        let (mut far_tx, mut far_rx) = Box::new(far).split();
        far_tx.send(&AudioFrame::handshake()).await.unwrap();
        // No accept within the window: the stream drops, no reply frame.
        let outcome = serve.await.unwrap();
        assert!(matches!(outcome, Err(CallError::AcceptTimeout(_))));
        assert!(far_rx.recv().await.unwrap().is_none());
        assert_eq!(fx.status.snapshot(), StationFlags::DO_NOT_DISTURB);
    }

    #[tokio::test]
    async fn do_not_disturb_accept_completes_the_handshake() {
        let fx = fixture(Vec::new());
        fx.status.set(StationFlags::DO_NOT_DISTURB);

        let (near, far) = memory::pair();
        let manager = fx.manager.clone();
        let serve = tokio::spawn(manager.serve(Box::new(near), "caller".into(), "callee".into()));

        let status = fx.status.clone();
        assert!(
            wait_until(
                || status.has(StationFlags::INCOMING_CALL),
                Duration::from_secs(1)
            )
            .await
        );
        fx.manager.accept();

        let (mut far_tx, mut far_rx) = Box::new(far).split();
        far_tx.send(&AudioFrame::handshake()).await.unwrap();
        assert!(far_rx.recv().await.unwrap().unwrap().is_handshake());
        let status = fx.status.clone();
        assert!(
            wait_until(
                || status.has(StationFlags::CALL_CONNECTED),
                Duration::from_secs(1)
            )
            .await
        );
        assert!(fx.status.has(StationFlags::DO_NOT_DISTURB));

        far_tx.close_send().await;
        serve.await.unwrap().unwrap();
        assert_eq!(fx.status.snapshot(), StationFlags::DO_NOT_DISTURB);
    }

    #[tokio::test]
    async fn busy_station_auto_rejects_a_second_incoming_call() {
        let fx = fixture(Vec::new());

        let (near, far) = memory::pair();
        let manager = fx.manager.clone();
        let _serve = tokio::spawn(manager.serve(Box::new(near), "first".into(), "callee".into()));
        let (mut far_tx, mut far_rx) = Box::new(far).split();
        far_tx.send(&AudioFrame::handshake()).await.unwrap();
        far_rx.recv().await.unwrap();

        let (second_near, second_far) = memory::pair();
        let manager = fx.manager.clone();
        manager
            .serve(Box::new(second_near), "second".into(), "callee".into())
            .await
            .unwrap();
        let (_tx2, mut rx2) = Box::new(second_far).split();
        // The second caller sees end-of-stream, never a handshake reply.
        assert!(rx2.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn accept_without_a_waiting_call_is_a_no_op() {
        let fx = fixture(Vec::new());
        fx.manager.accept();
        fx.manager.reject();
        assert!(!fx.manager.has_calls());
        assert_eq!(fx.status.snapshot(), StationFlags::empty());
    }

    /// Receiver wrapper that fails after its scripted frames run out.
    struct FailingReceiver {
        inner: Box<dyn FrameReceiver>,
        remaining: usize,
    }

    #[async_trait]
    impl FrameReceiver for FailingReceiver {
        async fn recv(&mut self) -> Result<Option<AudioFrame>, WireError> {
            if self.remaining == 0 {
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )));
            }
            self.remaining -= 1;
            self.inner.recv().await
        }
    }

    struct FailingStream {
        inner: Box<MemoryCallStream>,
        good_recvs: usize,
    }

    impl CallStream for FailingStream {
        fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
            let (tx, rx) = self.inner.split();
            (
                tx,
                Box::new(FailingReceiver {
                    inner: rx,
                    remaining: self.good_recvs,
                }),
            )
        }
    }

    #[tokio::test]
    async fn transport_error_mid_call_tears_the_call_down() {
        let fx = fixture(Vec::new());
        let (near, far) = memory::pair();
        let manager = fx.manager.clone();
        let serve = tokio::spawn(manager.serve(
            Box::new(FailingStream {
                inner: Box::new(near),
                good_recvs: 1, // the handshake frame
            }),
            "caller".into(),
            "callee".into(),
        ));

        let (mut far_tx, mut far_rx) = Box::new(far).split();
        far_tx.send(&AudioFrame::handshake()).await.unwrap();
        assert!(far_rx.recv().await.unwrap().unwrap().is_handshake());

        let started = tokio::time::Instant::now();
        let outcome = serve.await.unwrap();
        assert!(matches!(outcome, Err(CallError::TransportIo(_))));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert!(!fx.manager.has_calls());
        // Every flag returns to rest once the error flash lapses, not just
        // the connected bit.
        let status = fx.status.clone();
        assert!(
            wait_until(
                || status.snapshot() == StationFlags::empty(),
                Duration::from_secs(2)
            )
            .await
        );
    }
}
