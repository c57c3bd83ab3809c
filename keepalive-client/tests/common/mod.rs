//! Scripted transport for driving the client without a network.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use keepalive_client::{
    BodySink, ClientConfig, Connector, Destination, PersistentHttpClient, Response,
    SocketOptions, Timeouts, TlsSettings, Transport, TransportError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// What the next `send` does.
pub enum Step {
    /// Answer `200 OK` over HTTP/1.1 with body `ok`.
    Ok,
    /// Answer with this response.
    Respond(Response),
    /// Fail with this error.
    Fail(TransportError),
    /// Wait, then answer `200 OK`.
    Stall(Duration),
}

/// Transport calls observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created { authority: String, proxied: bool },
    ConfigureTls,
    SetTimeouts(Timeouts),
    Start,
    Send,
    Finish,
}

/// A request as the transport received it.
#[derive(Debug, Clone)]
pub struct Sent {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

#[derive(Default)]
struct State {
    steps: VecDeque<Step>,
    start_errors: VecDeque<TransportError>,
    events: Vec<Event>,
    sent: Vec<Sent>,
}

/// Shared script and log behind every transport a connector creates.
#[derive(Clone, Default)]
pub struct Script {
    state: Arc<Mutex<State>>,
}

impl Script {
    pub fn push(&self, step: Step) -> &Self {
        self.state.lock().steps.push_back(step);
        self
    }

    pub fn fail_start(&self, err: TransportError) -> &Self {
        self.state.lock().start_errors.push_back(err);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| *event == wanted)
            .count()
    }

    pub fn created(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| matches!(event, Event::Created { .. }))
            .count()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state.lock().sent.clone()
    }

    fn record(&self, event: Event) {
        self.state.lock().events.push(event);
    }
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    pub script: Script,
}

impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    fn create(&self, destination: &Destination) -> ScriptedTransport {
        self.script.record(Event::Created {
            authority: destination.authority(),
            proxied: destination.proxy.is_some(),
        });
        ScriptedTransport {
            script: self.script.clone(),
            started: false,
        }
    }
}

pub struct ScriptedTransport {
    script: Script,
    started: bool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn configure_tls(&mut self, _settings: &TlsSettings) -> Result<(), TransportError> {
        self.script.record(Event::ConfigureTls);
        Ok(())
    }

    fn set_socket_options(&mut self, _options: &SocketOptions) {}

    fn set_timeouts(&mut self, timeouts: &Timeouts) {
        self.script.record(Event::SetTimeouts(*timeouts));
    }

    async fn start(&mut self) -> Result<(), TransportError> {
        let failure = self.script.state.lock().start_errors.pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.started = true;
        self.script.record(Event::Start);
        Ok(())
    }

    async fn send(
        &mut self,
        request: http::Request<Bytes>,
        sink: Option<&mut BodySink<'_>>,
    ) -> Result<Response, TransportError> {
        if !self.started {
            return Err(TransportError::Closed("not started".into()));
        }

        let step = {
            let mut state = self.script.state.lock();
            state.events.push(Event::Send);
            state.sent.push(Sent {
                method: request.method().clone(),
                uri: request.uri().clone(),
                headers: request.headers().clone(),
            });
            state.steps.pop_front().unwrap_or(Step::Ok)
        };

        let response = match step {
            Step::Ok => ok(),
            Step::Respond(response) => response,
            Step::Fail(err) => return Err(err),
            Step::Stall(delay) => {
                tokio::time::sleep(delay).await;
                ok()
            }
        };

        match sink {
            Some(sink) => {
                for chunk in response.bytes().chunks(2) {
                    sink(chunk);
                }
                Ok(Response::new(
                    response.status(),
                    response.version(),
                    response.headers().clone(),
                    Bytes::new(),
                ))
            }
            None => Ok(response),
        }
    }

    fn finish(&mut self) {
        if self.started {
            self.started = false;
            self.script.record(Event::Finish);
        }
    }

    fn is_started(&self) -> bool {
        self.started
    }
}

pub fn ok() -> Response {
    Response::new(
        StatusCode::OK,
        Version::HTTP_11,
        HeaderMap::new(),
        Bytes::from_static(b"ok"),
    )
}

pub fn reset() -> TransportError {
    TransportError::Io(io::Error::from(io::ErrorKind::ConnectionReset))
}

pub fn client(config: ClientConfig) -> (PersistentHttpClient<ScriptedConnector>, Script) {
    let connector = ScriptedConnector::default();
    let script = connector.script.clone();
    (PersistentHttpClient::with_connector(config, connector), script)
}

pub fn post(url: &str) -> http::Request<Bytes> {
    http::Request::post(url)
        .body(Bytes::from_static(b"payload"))
        .unwrap()
}
