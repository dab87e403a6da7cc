//! Transport service loop.
//!
//! Runs on its own thread and owns the transport. Each iteration checks the
//! shutdown flag and then services one bounded tick. Protocol callbacks move
//! messages between the transport and the two queues.

use std::{sync::Arc, time::Duration};

use crate::domain::{
    ConnectionSummary, Message, MessageQueue, PeerInfo, ProtocolHandler, ProtocolOptions,
    ShutdownFlag, ShutdownState, Transport, TransportError,
};

/// Longest a tick waits for network activity.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1000);

/// Longest the close handshake may take once the loop has stopped.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Protocol callbacks connecting the transport to the relay queues.
pub struct RelayHandler {
    outbound: Arc<MessageQueue>,
    inbound: Arc<MessageQueue>,
    shutdown: Arc<ShutdownFlag>,
    options: ProtocolOptions,
}

impl RelayHandler {
    pub fn new(
        outbound: Arc<MessageQueue>,
        inbound: Arc<MessageQueue>,
        shutdown: Arc<ShutdownFlag>,
        options: ProtocolOptions,
    ) -> Self {
        Self {
            outbound,
            inbound,
            shutdown,
            options,
        }
    }
}

impl ProtocolHandler for RelayHandler {
    fn on_established(&mut self, peer: &PeerInfo) {
        tracing::debug!("Peer #{} ({}) ready for relay", peer.id, peer.addr);
    }

    fn on_writable(&mut self) -> Vec<Message> {
        self.outbound.drain_all()
    }

    fn on_receive(&mut self, peer: &PeerInfo, message: Message) {
        tracing::debug!("Received {} bytes from {}", message.len(), peer.addr);
        self.inbound.enqueue(message);
    }

    fn on_undelivered(&mut self, messages: Vec<Message>) {
        tracing::debug!("{} outbound messages returned to the queue", messages.len());
        self.outbound.requeue_front(messages);
    }

    fn on_closed(&mut self, summary: &ConnectionSummary) {
        tracing::debug!(
            "Peer {} closed after {} received / {} sent",
            summary.peer.addr,
            summary.received,
            summary.sent
        );

        match self.shutdown.state() {
            ShutdownState::Interrupted if summary.graceful => {
                if self.shutdown.complete_close().is_ok() {
                    tracing::info!("Close handshake completed after interrupt");
                }
            }
            ShutdownState::Running if self.options.once => {
                let result = if summary.completed_exchange() {
                    self.shutdown.finish()
                } else {
                    self.shutdown.interrupt()
                };
                match result {
                    Ok(()) => tracing::info!(
                        "Once mode: first connection closed, shutting down ({})",
                        self.shutdown.state()
                    ),
                    Err(e) => tracing::debug!("Once mode shutdown skipped: {}", e),
                }
            }
            _ => {}
        }
    }
}

/// Drives a [`Transport`] until shutdown or failure.
pub struct ServiceLoop<T> {
    transport: T,
    handler: RelayHandler,
    shutdown: Arc<ShutdownFlag>,
    tick: Duration,
    close_timeout: Duration,
}

impl<T: Transport> ServiceLoop<T> {
    pub fn new(transport: T, handler: RelayHandler, shutdown: Arc<ShutdownFlag>) -> Self {
        Self {
            transport,
            handler,
            shutdown,
            tick: DEFAULT_TICK,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Run until the shutdown flag leaves `running` or a tick fails.
    ///
    /// After a normal stop the open connection gets a bounded close
    /// handshake. A failed tick is returned as-is, without retry, and moves
    /// the flag to `interrupted` so the other threads wind down. The transport
    /// is dropped when this returns.
    pub fn run(mut self) -> Result<(), TransportError> {
        tracing::info!("Service loop started (tick: {:?})", self.tick);

        let result = loop {
            if !self.shutdown.is_running() {
                break Ok(());
            }
            if let Err(e) = self.transport.service(self.tick, &mut self.handler) {
                break Err(e);
            }
        };

        match &result {
            Ok(()) => {
                tracing::info!("Service loop stopping ({})", self.shutdown.state());
                if let Err(e) = self
                    .transport
                    .close_all(self.close_timeout, &mut self.handler)
                {
                    tracing::warn!("Close handshake failed: {}", e);
                }
            }
            Err(e) => {
                tracing::error!("Service loop failed: {}", e);
                if let Err(e) = self.shutdown.interrupt() {
                    tracing::debug!("Shutdown already in progress: {}", e);
                }
            }
        }

        tracing::info!("Service loop stopped ({})", self.shutdown.state());
        result
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        net::SocketAddr,
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    use parking_lot::Mutex;

    use super::*;

    // ========================================
    // テスト作業記録
    // ========================================
    // 【何をテストするか】
    // - ServiceLoop::run のライフサイクル（停止条件、close handshake、失敗時の伝播）
    // - RelayHandler によるキューとの受け渡し
    //
    // 【どのようなシナリオをテストするか】
    // 1. writable コールバックで outbound キューが順序通り送信される
    // 2. 受信メッセージが inbound キューに入る
    // 3. tick の失敗でループが終了し、失敗終了になる
    // 4. 待機中の割り込みを tick 一回分以内に検知して終了する
    // 5. 割り込み後の close handshake 完了で clean-exit になる
    // 6. once モード
    // 7. 書き込めなかったメッセージが outbound キューの先頭に戻る
    // ========================================

    enum Step {
        Writable,
        Receive(&'static str),
        WriteFailed,
        PeerClosed { graceful: bool },
        Fail,
    }

    #[derive(Default)]
    struct Record {
        sent: Vec<Message>,
        ticks: usize,
        close_calls: usize,
    }

    /// Transport double that plays back a script, one step per tick.
    struct ScriptedTransport {
        steps: VecDeque<Step>,
        record: Arc<Mutex<Record>>,
        peer: Option<PeerInfo>,
        received: usize,
        sent: usize,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> (Self, Arc<Mutex<Record>>) {
            let record = Arc::new(Mutex::new(Record::default()));
            let peer = PeerInfo {
                id: 1,
                addr: SocketAddr::from(([127, 0, 0, 1], 40000)),
                protocol: None,
            };
            (
                Self {
                    steps: steps.into(),
                    record: record.clone(),
                    peer: Some(peer),
                    received: 0,
                    sent: 0,
                },
                record,
            )
        }

        fn summary(&self, peer: PeerInfo, graceful: bool) -> ConnectionSummary {
            ConnectionSummary {
                peer,
                received: self.received,
                sent: self.sent,
                graceful,
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn service(
            &mut self,
            timeout: Duration,
            handler: &mut dyn ProtocolHandler,
        ) -> Result<(), TransportError> {
            self.record.lock().ticks += 1;
            match self.steps.pop_front() {
                Some(Step::Writable) => {
                    let batch = handler.on_writable();
                    self.sent += batch.len();
                    self.record.lock().sent.extend(batch);
                }
                Some(Step::WriteFailed) => {
                    let batch = handler.on_writable();
                    handler.on_undelivered(batch);
                }
                Some(Step::Receive(text)) => {
                    if let Some(peer) = &self.peer {
                        self.received += 1;
                        handler.on_receive(peer, Message::from(text));
                    }
                }
                Some(Step::PeerClosed { graceful }) => {
                    if let Some(peer) = self.peer.take() {
                        handler.on_closed(&self.summary(peer, graceful));
                    }
                }
                Some(Step::Fail) => {
                    return Err(TransportError::Failed("scripted failure".to_string()));
                }
                None => thread::sleep(timeout),
            }
            Ok(())
        }

        fn close_all(
            &mut self,
            _timeout: Duration,
            handler: &mut dyn ProtocolHandler,
        ) -> Result<(), TransportError> {
            self.record.lock().close_calls += 1;
            if let Some(peer) = self.peer.take() {
                handler.on_closed(&self.summary(peer, true));
            }
            Ok(())
        }
    }

    struct Fixture {
        outbound: Arc<MessageQueue>,
        inbound: Arc<MessageQueue>,
        shutdown: Arc<ShutdownFlag>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                outbound: Arc::new(MessageQueue::new()),
                inbound: Arc::new(MessageQueue::new()),
                shutdown: Arc::new(ShutdownFlag::new()),
            }
        }

        fn service_loop(
            &self,
            transport: ScriptedTransport,
            options: ProtocolOptions,
        ) -> ServiceLoop<ScriptedTransport> {
            let handler = RelayHandler::new(
                self.outbound.clone(),
                self.inbound.clone(),
                self.shutdown.clone(),
                options,
            );
            ServiceLoop::new(transport, handler, self.shutdown.clone())
                .with_tick(Duration::from_millis(20))
        }
    }

    /// Finish the relay once the script has been played.
    fn finish_after(shutdown: &Arc<ShutdownFlag>, delay: Duration) -> thread::JoinHandle<()> {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = shutdown.finish();
        })
    }

    #[test]
    fn test_writable_transmits_outbound_queue_in_order() {
        // テスト項目: writable コールバックで outbound キューの内容が順序通り送信される
        // given (前提条件):
        let fixture = Fixture::new();
        fixture.outbound.enqueue("hello");
        fixture.outbound.enqueue("world");
        let (transport, record) = ScriptedTransport::new(vec![Step::Writable]);
        let finisher = finish_after(&fixture.shutdown, Duration::from_millis(100));

        // when (操作):
        let result = fixture
            .service_loop(transport, ProtocolOptions::default())
            .run();
        finisher.join().unwrap();

        // then (期待する結果):
        assert!(result.is_ok());
        assert_eq!(
            record.lock().sent,
            vec![Message::from("hello"), Message::from("world")]
        );
        assert!(fixture.outbound.is_empty());
        assert_eq!(fixture.shutdown.state(), ShutdownState::CleanExit);
    }

    #[test]
    fn test_undelivered_batch_is_sent_on_next_writable() {
        // テスト項目: 書き込みに失敗したメッセージは outbound キューに戻り、次の writable で順序通り送信される
        // given (前提条件):
        let fixture = Fixture::new();
        fixture.outbound.enqueue("hello");
        fixture.outbound.enqueue("world");
        let (transport, record) = ScriptedTransport::new(vec![Step::WriteFailed, Step::Writable]);
        let finisher = finish_after(&fixture.shutdown, Duration::from_millis(100));

        // when (操作):
        let result = fixture
            .service_loop(transport, ProtocolOptions::default())
            .run();
        finisher.join().unwrap();

        // then (期待する結果):
        assert!(result.is_ok());
        assert_eq!(
            record.lock().sent,
            vec![Message::from("hello"), Message::from("world")]
        );
        assert!(fixture.outbound.is_empty());
    }

    #[test]
    fn test_received_messages_land_in_inbound_queue() {
        // テスト項目: 受信したメッセージが順序通り inbound キューに入る
        // given (前提条件):
        let fixture = Fixture::new();
        let (transport, _record) =
            ScriptedTransport::new(vec![Step::Receive("ping"), Step::Receive("pong")]);
        let finisher = finish_after(&fixture.shutdown, Duration::from_millis(100));

        // when (操作):
        let result = fixture
            .service_loop(transport, ProtocolOptions::default())
            .run();
        finisher.join().unwrap();

        // then (期待する結果):
        assert!(result.is_ok());
        assert_eq!(
            fixture.inbound.drain_all(),
            vec![Message::from("ping"), Message::from("pong")]
        );
    }

    #[test]
    fn test_failed_tick_stops_loop_with_failure() {
        // テスト項目: tick が失敗するとループが終了し、エラーが伝播して失敗終了コードになる
        // given (前提条件):
        let fixture = Fixture::new();
        fixture.outbound.enqueue("never sent");
        let (transport, record) = ScriptedTransport::new(vec![Step::Fail, Step::Writable]);

        // when (操作):
        let result = fixture
            .service_loop(transport, ProtocolOptions::default())
            .run();

        // then (期待する結果):
        assert!(matches!(result, Err(TransportError::Failed(_))));
        let record = record.lock();
        assert_eq!(record.ticks, 1);
        assert_eq!(record.close_calls, 0);
        assert!(record.sent.is_empty());
        assert_eq!(fixture.shutdown.state(), ShutdownState::Interrupted);
        assert_ne!(fixture.shutdown.exit_code(), 0);
    }

    #[test]
    fn test_interrupt_is_observed_within_one_tick() {
        // テスト項目: 待機中に割り込みが入ると、tick 一回分の待機時間以内にループが終了する
        // given (前提条件):
        let fixture = Fixture::new();
        let (transport, _record) = ScriptedTransport::new(vec![]);
        let tick = Duration::from_millis(200);
        let service_loop = fixture
            .service_loop(transport, ProtocolOptions::default())
            .with_tick(tick);
        let shutdown = fixture.shutdown.clone();

        // when (操作):
        let started = Instant::now();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            shutdown.interrupt().unwrap();
            Instant::now()
        });
        let result = service_loop.run();
        let stopped = Instant::now();
        let interrupted_at = interrupter.join().unwrap();

        // then (期待する結果):
        assert!(result.is_ok());
        assert!(stopped.duration_since(interrupted_at) <= tick + Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_interrupt_with_completed_close_is_clean_exit() {
        // テスト項目: 割り込み後に close handshake が完了すると clean-exit になる
        // given (前提条件):
        let fixture = Fixture::new();
        let (transport, record) = ScriptedTransport::new(vec![]);
        fixture.shutdown.interrupt().unwrap();

        // when (操作):
        let result = fixture
            .service_loop(transport, ProtocolOptions::default())
            .run();

        // then (期待する結果):
        assert!(result.is_ok());
        assert_eq!(record.lock().close_calls, 1);
        assert_eq!(fixture.shutdown.state(), ShutdownState::CleanExit);
        assert_eq!(fixture.shutdown.exit_code(), 0);
    }

    #[test]
    fn test_interrupt_without_open_connection_stays_interrupted() {
        // テスト項目: 割り込み時に接続が残っていなければ close handshake は行われず、interrupted のまま失敗終了になる
        // given (前提条件):
        let fixture = Fixture::new();
        let (transport, _record) =
            ScriptedTransport::new(vec![Step::PeerClosed { graceful: false }]);
        let shutdown = fixture.shutdown.clone();
        let service_loop = fixture.service_loop(transport, ProtocolOptions::default());

        // when (操作):
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            shutdown.interrupt().unwrap();
        });
        let result = service_loop.run();
        interrupter.join().unwrap();

        // then (期待する結果):
        assert!(result.is_ok());
        assert_eq!(fixture.shutdown.state(), ShutdownState::Interrupted);
        assert_ne!(fixture.shutdown.exit_code(), 0);
    }

    #[test]
    fn test_once_mode_after_full_exchange_is_clean_exit() {
        // テスト項目: once モードで送受信が完了した接続が閉じると clean-exit で終了する
        // given (前提条件):
        let fixture = Fixture::new();
        fixture.outbound.enqueue("hello");
        let (transport, _record) = ScriptedTransport::new(vec![
            Step::Receive("hi"),
            Step::Writable,
            Step::PeerClosed { graceful: true },
        ]);

        // when (操作):
        let result = fixture
            .service_loop(transport, ProtocolOptions { once: true })
            .run();

        // then (期待する結果):
        assert!(result.is_ok());
        assert_eq!(fixture.shutdown.state(), ShutdownState::CleanExit);
    }

    #[test]
    fn test_once_mode_without_exchange_is_interrupted() {
        // テスト項目: once モードで送受信が揃わないまま接続が閉じると interrupted で終了する
        // given (前提条件):
        let fixture = Fixture::new();
        let (transport, _record) = ScriptedTransport::new(vec![
            Step::Receive("hi"),
            Step::PeerClosed { graceful: true },
        ]);

        // when (操作):
        let result = fixture
            .service_loop(transport, ProtocolOptions { once: true })
            .run();

        // then (期待する結果):
        assert!(result.is_ok());
        assert_eq!(fixture.shutdown.state(), ShutdownState::Interrupted);
    }

    #[test]
    fn test_without_once_mode_peer_close_keeps_running() {
        // テスト項目: once モードでなければ、相手の切断後もループは動き続ける
        // given (前提条件):
        let fixture = Fixture::new();
        let (transport, record) =
            ScriptedTransport::new(vec![Step::PeerClosed { graceful: true }]);
        let finisher = finish_after(&fixture.shutdown, Duration::from_millis(100));

        // when (操作):
        let result = fixture
            .service_loop(transport, ProtocolOptions::default())
            .run();
        finisher.join().unwrap();

        // then (期待する結果):
        assert!(result.is_ok());
        assert!(record.lock().ticks > 1);
        assert_eq!(fixture.shutdown.state(), ShutdownState::CleanExit);
    }
}
