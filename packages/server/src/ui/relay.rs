//! Relay orchestration: wires the queues, the transport, and the three
//! threads together, and tears them down in order.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    domain::{
        MessageQueue, NegotiationConfig, ProtocolOptions, RELAY_PROTOCOL, ShutdownFlag,
        ShutdownState, ShutdownView, TransportError, WritableWaker,
    },
    error::RelayError,
    infrastructure::{
        ContextOptions, WsTransport, watch_interrupt, websocket::permessage_deflate,
    },
    usecase::{
        BRIDGE_INTERVAL, ConsoleBridge, ConsoleInputLoop, DEFAULT_CLOSE_TIMEOUT, DEFAULT_TICK,
        LineSource, RelayHandler, ServiceLoop,
    },
};

const SERVICE_THREAD: &str = "service-loop";
const BRIDGE_THREAD: &str = "console-bridge";

/// Relay settings, usually built from the command line.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    /// `0` picks an ephemeral port.
    pub port: u16,
    pub once: bool,
    /// Advertise the compression extension.
    pub extensions: bool,
    pub tick: Duration,
    pub bridge_interval: Duration,
    pub close_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7681,
            once: false,
            extensions: true,
            tick: DEFAULT_TICK,
            bridge_interval: BRIDGE_INTERVAL,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The negotiation config handed to the transport.
    pub fn negotiation(&self) -> NegotiationConfig {
        let options = ProtocolOptions { once: self.once };
        let config = NegotiationConfig::new(RELAY_PROTOCOL, options);
        if self.extensions {
            config.with_extension(permessage_deflate())
        } else {
            config
        }
    }
}

pub struct Relay {
    config: RelayConfig,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    /// Run the relay until the console input ends and the service loop has
    /// stopped.
    ///
    /// Returns the final shutdown state. A transport failure takes
    /// precedence over a console failure, which takes precedence over a
    /// console output failure.
    pub fn run(self, console: &mut dyn LineSource) -> Result<ShutdownState, RelayError> {
        let shutdown = Arc::new(ShutdownFlag::new());
        let outbound = Arc::new(MessageQueue::new());
        let inbound = Arc::new(MessageQueue::new());

        let transport = WsTransport::create(ContextOptions {
            bind_addr: self.config.bind_addr(),
            negotiation: Arc::new(
                self.config
                    .negotiation()
                    .with_shutdown(ShutdownView::new(shutdown.clone())),
            ),
        })?;
        tracing::info!("Listening on ws://{}", transport.local_addr());

        let waker = transport.waker();
        transport.spawn(watch_interrupt(shutdown.clone(), waker.clone()));

        let handler = RelayHandler::new(
            outbound.clone(),
            inbound.clone(),
            shutdown.clone(),
            transport.negotiation().options(),
        );
        let service_loop = ServiceLoop::new(transport, handler, shutdown.clone())
            .with_tick(self.config.tick)
            .with_close_timeout(self.config.close_timeout);
        let service = thread::Builder::new()
            .name(SERVICE_THREAD.to_string())
            .spawn(move || service_loop.run())
            .map_err(|source| RelayError::Spawn {
                name: SERVICE_THREAD,
                source,
            })?;

        let bridge = match ConsoleBridge::spawn(
            inbound,
            shutdown.clone(),
            self.config.bridge_interval,
            io::stderr(),
        ) {
            Ok(bridge) => bridge,
            Err(source) => {
                stop(&shutdown, &waker);
                let _ = join_service(service);
                return Err(RelayError::Spawn {
                    name: BRIDGE_THREAD,
                    source,
                });
            }
        };

        let input = ConsoleInputLoop::new(outbound, waker.clone(), shutdown.clone()).run(console);
        tracing::debug!("Console input finished: {:?}", input);

        let service = join_service(service);
        // A panicked service loop never moved the flag; the bridge needs it terminal.
        stop(&shutdown, &waker);
        let printed = bridge.finish();

        service?;
        input?;
        let printed = printed?;
        tracing::debug!("Relayed {} inbound messages to the console", printed);

        Ok(shutdown.state())
    }
}

fn stop(shutdown: &ShutdownFlag, waker: &WritableWaker) {
    if shutdown.interrupt().is_ok() {
        tracing::warn!("Stopping relay");
    }
    waker.request_writable();
}

fn join_service(service: JoinHandle<Result<(), TransportError>>) -> Result<(), RelayError> {
    match service.join() {
        Ok(result) => result.map_err(RelayError::from),
        Err(_) => Err(RelayError::ThreadPanicked(SERVICE_THREAD)),
    }
}
