//! Per-connection session task.
//!
//! [`SessionRunner`] owns everything mutable about one browser session: the
//! open transcription handle, the transcript buffer of the current utterance
//! and the in-flight synthesis task. Client events and transcription events
//! are processed one at a time, in arrival order.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use voice_relay_agent::ConversationEngine;
use voice_relay_core::protocol::{ClientEvent, ErrorSource, Outbound, ServerFrame};
use voice_relay_media::stt::{TranscriptResult, Transcriber, TranscriptionEvent, TranscriptionHandle};
use voice_relay_media::tts_stream::SpeechSynthesizer;

use crate::metrics;
use crate::registry::SessionInbox;

/// Collaborators shared by all sessions.
#[derive(Clone)]
pub struct SessionServices {
    pub engine: Arc<ConversationEngine>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

struct SynthesisTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SynthesisTask {
    /// Cancel the relay and wait until it can no longer send.
    async fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub struct SessionRunner {
    session_id: String,
    services: SessionServices,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    transcription: Option<TranscriptionHandle>,
    buffer: String,
    synthesis: Option<SynthesisTask>,
}

impl SessionRunner {
    pub fn new(
        session_id: String,
        services: SessionServices,
        outbound: mpsc::UnboundedSender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            services,
            outbound,
            cancel,
            transcription: None,
            buffer: String::new(),
            synthesis: None,
        }
    }

    /// Drive the session until it is cancelled or the inbox closes.
    ///
    /// `welcome` is announced and spoken before any event is handled.
    pub async fn run(mut self, mut inbox: SessionInbox, welcome: Option<String>) {
        if let Some(text) = welcome {
            self.speak(text).await;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => self.on_client_event(event).await,
                    None => break,
                },
                event = next_transcription_event(&mut self.transcription) => {
                    self.on_transcription_event(event).await;
                }
            }
        }

        self.shutdown().await;
    }

    async fn on_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::StartStream => self.start_stream().await,
            ClientEvent::AudioChunk(bytes) => {
                if let Some(handle) = &self.transcription {
                    if !handle.send_audio(bytes) {
                        debug!(session_id = %self.session_id, "Transcription stream gone, audio dropped");
                    }
                }
            }
            ClientEvent::StopStream => {
                if let Some(handle) = self.transcription.take() {
                    debug!(session_id = %self.session_id, "Finishing transcription stream");
                    handle.finish();
                }
            }
        }
    }

    async fn start_stream(&mut self) {
        if let Some(previous) = self.transcription.take() {
            debug!(session_id = %self.session_id, "Replacing open transcription stream");
            previous.finish();
        }
        self.buffer.clear();

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return,
            opened = self.services.transcriber.open(&self.session_id) => opened,
        };
        match opened {
            Ok(handle) => {
                info!(session_id = %self.session_id, "Transcription started");
                self.transcription = Some(handle);
            }
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Could not start transcription");
                self.report(ErrorSource::Transcription, format!("{e:#}"));
            }
        }
    }

    async fn on_transcription_event(&mut self, event: TranscriptionEvent) {
        match event {
            TranscriptionEvent::Transcript(result) => self.on_transcript(result).await,
            TranscriptionEvent::UtteranceEnd => self.end_utterance().await,
            TranscriptionEvent::Error(message) => {
                error!(session_id = %self.session_id, %message, "Transcription error");
                self.report(ErrorSource::Transcription, message);
            }
            TranscriptionEvent::Closed => {
                debug!(session_id = %self.session_id, "Transcription stream closed");
                self.transcription = None;
            }
        }
    }

    async fn on_transcript(&mut self, result: TranscriptResult) {
        if result.text.is_empty() {
            return;
        }
        self.send(ServerFrame::TranscriptUpdate {
            text: result.text.clone(),
            is_final: result.is_final,
            speech_final: result.speech_final,
        });

        if result.is_final {
            self.buffer.push_str(&result.text);
            self.buffer.push(' ');
        }
        if result.speech_final {
            self.end_utterance().await;
        }
    }

    /// Hand the buffered utterance to the engine and speak the reply.
    async fn end_utterance(&mut self) {
        let text = std::mem::take(&mut self.buffer).trim().to_string();
        if text.is_empty() {
            return;
        }
        metrics::record_utterance();
        info!(session_id = %self.session_id, chars = text.len(), "Utterance complete");

        let engine = self.services.engine.clone();
        let reply = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(session_id = %self.session_id, "Session closed during model call");
                return;
            }
            reply = engine.respond(&self.session_id, &text) => reply,
        };

        match reply {
            Ok(reply) => self.speak(reply).await,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Conversation engine failed");
                self.report(ErrorSource::Conversation, e.to_string());
            }
        }
    }

    /// Send the reply text and start speaking it, superseding any earlier reply.
    ///
    /// The previous relay is stopped and joined first, so none of its audio
    /// can follow the new `agent_response`.
    async fn speak(&mut self, text: String) {
        if let Some(previous) = self.synthesis.take() {
            debug!(session_id = %self.session_id, "Superseding in-flight synthesis");
            previous.stop().await;
        }
        self.send(ServerFrame::AgentResponse { text: text.clone() });

        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(synthesize_and_stream(
            self.services.synthesizer.clone(),
            text,
            self.session_id.clone(),
            self.outbound.clone(),
            cancel.clone(),
        ));
        self.synthesis = Some(SynthesisTask { cancel, handle });
    }

    fn send(&self, frame: ServerFrame) {
        if self.outbound.send(frame.into()).is_err() {
            debug!(session_id = %self.session_id, "Outbound channel closed");
        }
    }

    fn report(&self, source: ErrorSource, message: String) {
        metrics::record_error(error_kind(source));
        self.send(ServerFrame::Error { source, message });
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.transcription.take() {
            handle.finish();
        }
        if let Some(task) = self.synthesis.take() {
            task.stop().await;
        }
        debug!(session_id = %self.session_id, "Session task finished");
    }
}

/// Next event from the open stream; pending forever when there is none.
async fn next_transcription_event(handle: &mut Option<TranscriptionHandle>) -> TranscriptionEvent {
    match handle {
        Some(handle) => handle
            .events
            .recv()
            .await
            .unwrap_or(TranscriptionEvent::Closed),
        None => std::future::pending().await,
    }
}

fn error_kind(source: ErrorSource) -> &'static str {
    match source {
        ErrorSource::Transcription => "transcription",
        ErrorSource::Conversation => "conversation",
        ErrorSource::Synthesis => "synthesis",
    }
}

/// Relay synthesized audio for `text` to the client.
///
/// Chunks are forwarded as they arrive, followed by `audio_stream_end`. A
/// failed request produces an `error` frame and no audio. Cancellation stops
/// the relay silently.
pub async fn synthesize_and_stream(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    text: String,
    session_id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
) {
    let started = tokio::select! {
        _ = cancel.cancelled() => return,
        started = synthesizer.stream(&text) => started,
    };
    let mut audio = match started {
        Ok(audio) => audio,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Speech synthesis failed");
            metrics::record_synthesis("failed");
            metrics::record_error("synthesis");
            let _ = outbound.send(
                ServerFrame::Error {
                    source: ErrorSource::Synthesis,
                    message: format!("{e:#}"),
                }
                .into(),
            );
            return;
        }
    };

    let mut chunks = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(session_id = %session_id, chunks, "Synthesis cancelled");
                metrics::record_synthesis("cancelled");
                return;
            }
            next = audio.next() => match next {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    chunks += 1;
                    if outbound.send(Outbound::Audio(bytes.to_vec())).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(session_id = %session_id, error = %e, chunks, "Synthesis stream broke");
                    metrics::record_synthesis("failed");
                    metrics::record_error("synthesis");
                    let _ = outbound.send(
                        ServerFrame::Error {
                            source: ErrorSource::Synthesis,
                            message: format!("{e:#}"),
                        }
                        .into(),
                    );
                    return;
                }
                None => break,
            }
        }
    }

    metrics::record_synthesis("completed");
    debug!(session_id = %session_id, chunks, "Synthesis complete");
    let _ = outbound.send(ServerFrame::AudioStreamEnd.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use voice_relay_core::config::LlmConfig;
    use voice_relay_core::turn::Role;
    use voice_relay_core::turn_store::{MemoryTurnStore, TurnStore};
    use voice_relay_media::stt::StreamCommand;
    use voice_relay_media::tts_stream::AudioStream;
    use voice_relay_providers::{ChatModel, ChatRequest, Credentials};

    const WELCOME: &str = "Welcome to the hotel.";
    const OLD: &[u8] = b"OLD";

    /// Provider side of one fake transcription stream.
    struct FakeStream {
        events: mpsc::UnboundedSender<TranscriptionEvent>,
        commands: mpsc::UnboundedReceiver<StreamCommand>,
    }

    #[derive(Default)]
    struct FakeTranscriber {
        streams: Mutex<Vec<FakeStream>>,
        fail: bool,
    }

    impl FakeTranscriber {
        fn take_stream(&self, index: usize) -> FakeStream {
            self.streams.lock().unwrap().remove(index)
        }

        /// Streams opened and not yet taken by the test.
        fn pending(&self) -> usize {
            self.streams.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn open(&self, _session_id: &str) -> anyhow::Result<TranscriptionHandle> {
            if self.fail {
                anyhow::bail!("connect refused");
            }
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            self.streams.lock().unwrap().push(FakeStream {
                events: event_tx,
                commands: command_rx,
            });
            Ok(TranscriptionHandle::from_parts(command_tx, event_rx))
        }
    }

    /// Answers every call with "Reply to <text>", or fails.
    struct EchoModel {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ChatModel for EchoModel {
        fn id(&self) -> &str {
            "echo"
        }

        async fn complete(
            &self,
            request: &ChatRequest,
            _credentials: &Credentials,
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("model unavailable");
            }
            Ok(format!("Reply to {}", request.message))
        }
    }

    /// Streams two fixed chunks, or rejects the request like a non-200 status.
    ///
    /// With `endless_welcome` the welcome text streams "OLD" chunks forever.
    struct FakeSynthesizer {
        reject: bool,
        endless_welcome: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynthesizer {
        async fn stream(&self, text: &str) -> anyhow::Result<AudioStream> {
            if self.reject {
                anyhow::bail!("TTS API error 401 Unauthorized");
            }
            if self.endless_welcome && text == WELCOME {
                let chunks = futures::stream::unfold((), |()| async {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Some((Ok(Bytes::from_static(OLD)), ()))
                });
                return Ok(Box::pin(chunks));
            }
            let chunks = vec![Ok(Bytes::from_static(b"ID3")), Ok(Bytes::from_static(b"mp3"))];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    struct Harness {
        inbox: mpsc::UnboundedSender<ClientEvent>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        cancel: CancellationToken,
        transcriber: Arc<FakeTranscriber>,
        model: Arc<EchoModel>,
        store: Arc<MemoryTurnStore>,
        task: JoinHandle<()>,
    }

    #[derive(Default)]
    struct Options {
        welcome: Option<String>,
        model_fails: bool,
        tts_rejects: bool,
        stt_fails: bool,
        endless_welcome: bool,
    }

    fn start(options: Options) -> Harness {
        let transcriber = Arc::new(FakeTranscriber {
            fail: options.stt_fails,
            ..FakeTranscriber::default()
        });
        let model = Arc::new(EchoModel {
            calls: AtomicUsize::new(0),
            fail: options.model_fails,
        });
        let store = Arc::new(MemoryTurnStore::new());
        let engine = Arc::new(ConversationEngine::new(
            model.clone(),
            store.clone(),
            LlmConfig {
                api_key: Some("k".into()),
                ..LlmConfig::default()
            },
        ));
        let services = SessionServices {
            engine,
            transcriber: transcriber.clone(),
            synthesizer: Arc::new(FakeSynthesizer {
                reject: options.tts_rejects,
                endless_welcome: options.endless_welcome,
            }),
        };

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let runner = SessionRunner::new("sess-1".into(), services, out_tx, cancel.clone());
        let task = tokio::spawn(runner.run(inbox_rx, options.welcome));

        Harness {
            inbox: inbox_tx,
            outbound: out_rx,
            cancel,
            transcriber,
            model,
            store,
            task,
        }
    }

    impl Harness {
        async fn next(&mut self) -> Outbound {
            tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out waiting for outbound message")
                .expect("outbound channel closed")
        }

        /// Next message, or `None` once every sender has been dropped.
        async fn next_or_closed(&mut self) -> Option<Outbound> {
            tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out waiting for outbound channel to close")
        }

        async fn assert_quiet(&mut self) {
            let got = tokio::time::timeout(Duration::from_millis(100), self.outbound.recv()).await;
            assert!(got.is_err(), "unexpected outbound message: {got:?}");
        }

        fn send(&self, event: ClientEvent) {
            self.inbox.send(event).unwrap();
        }

        /// Start a stream and wait until the fake has it.
        async fn start_stream(&self) -> FakeStream {
            let before = self.transcriber.pending();
            self.send(ClientEvent::StartStream);
            for _ in 0..200 {
                if self.transcriber.pending() > before {
                    return self.transcriber.take_stream(before);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("transcription stream never opened");
        }
    }

    fn transcript(text: &str, is_final: bool, speech_final: bool) -> TranscriptionEvent {
        TranscriptionEvent::Transcript(TranscriptResult {
            text: text.into(),
            is_final,
            speech_final,
        })
    }

    fn frame(outbound: Outbound) -> ServerFrame {
        match outbound {
            Outbound::Frame(frame) => frame,
            Outbound::Audio(bytes) => panic!("expected frame, got {} audio bytes", bytes.len()),
        }
    }

    #[tokio::test]
    async fn test_welcome_is_announced_and_spoken() {
        let mut h = start(Options {
            welcome: Some(WELCOME.into()),
            ..Options::default()
        });
        assert_eq!(
            frame(h.next().await),
            ServerFrame::AgentResponse {
                text: WELCOME.into()
            }
        );
        assert_eq!(h.next().await, Outbound::Audio(b"ID3".to_vec()));
        assert_eq!(h.next().await, Outbound::Audio(b"mp3".to_vec()));
        assert_eq!(frame(h.next().await), ServerFrame::AudioStreamEnd);
    }

    #[tokio::test]
    async fn test_audio_before_start_is_dropped() {
        let mut h = start(Options::default());
        h.send(ClientEvent::AudioChunk(vec![0; 320]));
        h.assert_quiet().await;
        assert_eq!(h.transcriber.pending(), 0);

        let mut stream = h.start_stream().await;
        h.send(ClientEvent::AudioChunk(vec![7; 4]));
        let cmd = tokio::time::timeout(Duration::from_secs(2), stream.commands.recv())
            .await
            .unwrap();
        assert_eq!(cmd, Some(StreamCommand::Audio(vec![7; 4])));
    }

    #[tokio::test]
    async fn test_final_utterance_drives_reply() {
        let mut h = start(Options::default());
        let stream = h.start_stream().await;

        stream
            .events
            .send(transcript("Book a room for tonight", true, true))
            .unwrap();

        assert_eq!(
            frame(h.next().await),
            ServerFrame::TranscriptUpdate {
                text: "Book a room for tonight".into(),
                is_final: true,
                speech_final: true,
            }
        );
        assert_eq!(
            frame(h.next().await),
            ServerFrame::AgentResponse {
                text: "Reply to Book a room for tonight".into()
            }
        );
        assert!(matches!(h.next().await, Outbound::Audio(_)));
        assert!(matches!(h.next().await, Outbound::Audio(_)));
        assert_eq!(frame(h.next().await), ServerFrame::AudioStreamEnd);

        assert_eq!(h.model.calls.load(Ordering::SeqCst), 1);
        let turns = h.store.history("sess-1").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].text, "Book a room for tonight");
        assert_eq!(turns[1].role, Role::Agent);
    }

    #[tokio::test]
    async fn test_final_segments_accumulate_until_speech_final() {
        let mut h = start(Options::default());
        let stream = h.start_stream().await;

        stream.events.send(transcript("Book a", false, false)).unwrap();
        stream.events.send(transcript("Book a room", true, false)).unwrap();
        stream.events.send(transcript("for tonight", true, true)).unwrap();

        for _ in 0..3 {
            assert!(matches!(
                frame(h.next().await),
                ServerFrame::TranscriptUpdate { .. }
            ));
        }
        assert_eq!(
            frame(h.next().await),
            ServerFrame::AgentResponse {
                text: "Reply to Book a room for tonight".into()
            }
        );
    }

    #[tokio::test]
    async fn test_empty_utterance_skips_model() {
        let mut h = start(Options::default());
        let stream = h.start_stream().await;

        // Interim only, then an utterance boundary: nothing final was buffered.
        stream.events.send(transcript("uh", false, false)).unwrap();
        stream.events.send(TranscriptionEvent::UtteranceEnd).unwrap();
        stream.events.send(transcript("   ", true, true)).unwrap();

        assert!(matches!(
            frame(h.next().await),
            ServerFrame::TranscriptUpdate { is_final: false, .. }
        ));
        // The whitespace transcript is forwarded but trims to nothing.
        assert!(matches!(
            frame(h.next().await),
            ServerFrame::TranscriptUpdate { speech_final: true, .. }
        ));
        h.assert_quiet().await;
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.history("sess-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_transcript_text_is_ignored() {
        let mut h = start(Options::default());
        let stream = h.start_stream().await;
        stream.events.send(transcript("", true, true)).unwrap();
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_utterance_end_flushes_buffer() {
        let mut h = start(Options::default());
        let stream = h.start_stream().await;
        stream.events.send(transcript("Late checkout?", true, false)).unwrap();
        stream.events.send(TranscriptionEvent::UtteranceEnd).unwrap();

        assert!(matches!(
            frame(h.next().await),
            ServerFrame::TranscriptUpdate { .. }
        ));
        assert_eq!(
            frame(h.next().await),
            ServerFrame::AgentResponse {
                text: "Reply to Late checkout?".into()
            }
        );
    }

    #[tokio::test]
    async fn test_synthesis_rejection_sends_no_audio() {
        let mut h = start(Options {
            welcome: Some(WELCOME.into()),
            tts_rejects: true,
            ..Options::default()
        });
        assert!(matches!(
            frame(h.next().await),
            ServerFrame::AgentResponse { .. }
        ));
        assert!(matches!(
            frame(h.next().await),
            ServerFrame::Error {
                source: ErrorSource::Synthesis,
                ..
            }
        ));
        h.assert_quiet().await;

        // Session still usable.
        let stream = h.start_stream().await;
        stream.events.send(transcript("Hello", true, true)).unwrap();
        assert!(matches!(
            frame(h.next().await),
            ServerFrame::TranscriptUpdate { .. }
        ));
        assert!(matches!(
            frame(h.next().await),
            ServerFrame::AgentResponse { .. }
        ));
    }

    #[tokio::test]
    async fn test_model_error_is_reported_and_nothing_persisted() {
        let mut h = start(Options {
            model_fails: true,
            ..Options::default()
        });
        let stream = h.start_stream().await;
        stream.events.send(transcript("Hello", true, true)).unwrap();

        assert!(matches!(
            frame(h.next().await),
            ServerFrame::TranscriptUpdate { .. }
        ));
        assert!(matches!(
            frame(h.next().await),
            ServerFrame::Error {
                source: ErrorSource::Conversation,
                ..
            }
        ));
        assert!(h.store.history("sess-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transcription_open_failure_is_reported() {
        let mut h = start(Options {
            stt_fails: true,
            ..Options::default()
        });
        h.send(ClientEvent::StartStream);
        assert!(matches!(
            frame(h.next().await),
            ServerFrame::Error {
                source: ErrorSource::Transcription,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stop_and_restart_stream() {
        let h = start(Options::default());
        let mut first = h.start_stream().await;

        // A second start finishes the first stream.
        let _second = h.start_stream().await;
        let cmd = tokio::time::timeout(Duration::from_secs(2), first.commands.recv())
            .await
            .unwrap();
        assert_eq!(cmd, Some(StreamCommand::Finish));

        let mut third = h.start_stream().await;
        h.send(ClientEvent::StopStream);
        let cmd = tokio::time::timeout(Duration::from_secs(2), third.commands.recv())
            .await
            .unwrap();
        assert_eq!(cmd, Some(StreamCommand::Finish));
    }

    #[tokio::test]
    async fn test_cancel_finishes_stream_and_ends_task() {
        let h = start(Options::default());
        let mut stream = h.start_stream().await;

        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .unwrap()
            .unwrap();
        let cmd = stream.commands.recv().await;
        assert_eq!(cmd, Some(StreamCommand::Finish));
    }

    #[tokio::test]
    async fn test_cancel_stops_synthesis_relay() {
        let mut h = start(Options {
            welcome: Some(WELCOME.into()),
            endless_welcome: true,
            ..Options::default()
        });
        assert!(matches!(
            frame(h.next().await),
            ServerFrame::AgentResponse { .. }
        ));
        assert_eq!(h.next().await, Outbound::Audio(OLD.to_vec()));

        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), &mut h.task)
            .await
            .unwrap()
            .unwrap();

        // Whatever was queued before cancellation drains, then every sender is gone.
        loop {
            match h.next_or_closed().await {
                Some(Outbound::Audio(bytes)) => assert_eq!(bytes, OLD.to_vec()),
                Some(Outbound::Frame(frame)) => panic!("unexpected frame after cancel: {frame:?}"),
                None => break,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_new_reply_supersedes_running_synthesis() {
        for _ in 0..20 {
            let mut h = start(Options {
                welcome: Some(WELCOME.into()),
                endless_welcome: true,
                ..Options::default()
            });
            assert_eq!(
                frame(h.next().await),
                ServerFrame::AgentResponse {
                    text: WELCOME.into()
                }
            );
            assert_eq!(h.next().await, Outbound::Audio(OLD.to_vec()));

            let stream = h.start_stream().await;
            stream.events.send(transcript("Hi", true, true)).unwrap();

            // Welcome audio may still arrive until the reply is announced.
            loop {
                match h.next().await {
                    Outbound::Audio(bytes) => assert_eq!(bytes, OLD.to_vec()),
                    Outbound::Frame(ServerFrame::TranscriptUpdate { .. }) => {}
                    Outbound::Frame(ServerFrame::AgentResponse { text }) => {
                        assert_eq!(text, "Reply to Hi");
                        break;
                    }
                    Outbound::Frame(other) => panic!("unexpected frame before reply: {other:?}"),
                }
            }

            assert_eq!(h.next().await, Outbound::Audio(b"ID3".to_vec()));
            assert_eq!(h.next().await, Outbound::Audio(b"mp3".to_vec()));
            assert_eq!(frame(h.next().await), ServerFrame::AudioStreamEnd);
            h.assert_quiet().await;
        }
    }
}
