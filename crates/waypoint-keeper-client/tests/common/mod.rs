//! In-process Keeper double backed by wiremock

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use waypoint_keeper_client::{
    constants::{API_VERSION, STATUS_DOWN, STATUS_UP, keeper_api_path},
    model::{
        AddRegistrationRequest, BaseResponse, MultiRegistrationsResponse, RegistrationDTO,
        RegistrationResponse,
    },
};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate, matchers::any};

#[derive(Default)]
struct KeeperState {
    registrations: BTreeMap<String, RegistrationDTO>,
    required_token: Option<String>,
    failure: Option<u16>,
    clock: i64,
}

fn envelope(status: u16, message: &str) -> BaseResponse {
    BaseResponse {
        api_version: API_VERSION.to_string(),
        request_id: String::new(),
        message: message.to_string(),
        status_code: status,
    }
}

fn error(status: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(envelope(status, message))
}

struct KeeperResponder {
    state: Arc<Mutex<KeeperState>>,
}

impl KeeperResponder {
    fn store(&self, state: &mut KeeperState, request: &Request, update: bool) -> ResponseTemplate {
        let add: AddRegistrationRequest = match serde_json::from_slice(&request.body) {
            Ok(add) => add,
            Err(e) => return error(400, &e.to_string()),
        };
        let mut registration = add.registration;
        let existing = state.registrations.get(&registration.service_id).cloned();
        state.clock += 1;

        match (existing, update) {
            (Some(_), false) => error(409, "service already registered"),
            (None, true) => error(404, "service not registered"),
            (existing, _) => {
                registration.status = STATUS_DOWN.to_string();
                registration.created = existing.map_or(state.clock, |e| e.created);
                registration.modified = state.clock;
                state
                    .registrations
                    .insert(registration.service_id.clone(), registration);
                ResponseTemplate::new(if update { 204 } else { 201 })
            }
        }
    }
}

impl Respond for KeeperResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let path = request.url.path().to_string();
        let method = request.method.as_str().to_string();

        if path == keeper_api_path::PING {
            return ResponseTemplate::new(200).set_body_string("pong");
        }

        if let Some(required) = &state.required_token {
            let sent = request
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if sent != format!("Bearer {}", required) {
                return error(401, "invalid token");
            }
        }

        if let Some(status) = state.failure {
            return error(status, "database unavailable");
        }

        match (method.as_str(), path.as_str()) {
            ("POST", keeper_api_path::REGISTRY) => self.store(&mut state, request, false),
            ("PUT", keeper_api_path::REGISTRY) => self.store(&mut state, request, true),
            ("GET", keeper_api_path::REGISTRY_ALL) => {
                let registrations: Vec<RegistrationDTO> =
                    state.registrations.values().cloned().collect();
                let response = MultiRegistrationsResponse {
                    base: envelope(200, ""),
                    total_count: registrations.len() as u32,
                    registrations: (!registrations.is_empty()).then_some(registrations),
                };
                ResponseTemplate::new(200).set_body_json(response)
            }
            (method, p) if p.starts_with(keeper_api_path::REGISTRY_BY_SERVICE_ID) => {
                let id = p.trim_start_matches(keeper_api_path::REGISTRY_BY_SERVICE_ID);
                match method {
                    "GET" => match state.registrations.get(id) {
                        Some(registration) => ResponseTemplate::new(200).set_body_json(
                            RegistrationResponse {
                                base: envelope(200, ""),
                                registration: registration.clone(),
                            },
                        ),
                        None => error(404, "not found"),
                    },
                    "DELETE" => match state.registrations.remove(id) {
                        Some(_) => ResponseTemplate::new(200),
                        None => error(404, "not found"),
                    },
                    _ => error(405, "method not allowed"),
                }
            }
            _ => error(404, "unknown endpoint"),
        }
    }
}

pub struct MockKeeper {
    server: MockServer,
    state: Arc<Mutex<KeeperState>>,
}

impl MockKeeper {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(KeeperState::default()));

        Mock::given(any())
            .respond_with(KeeperResponder {
                state: state.clone(),
            })
            .mount(&server)
            .await;

        Self { server, state }
    }

    fn state(&self) -> MutexGuard<'_, KeeperState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn host(&self) -> String {
        self.server.address().ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.server.address().port()
    }

    pub fn require_token(&self, token: &str) {
        self.state().required_token = Some(token.to_string());
    }

    /// Answer every registry request with `status`
    pub fn fail_with(&self, status: u16) {
        self.state().failure = Some(status);
    }

    pub fn registration(&self, service_id: &str) -> Option<RegistrationDTO> {
        self.state().registrations.get(service_id).cloned()
    }

    pub fn set_status(&self, service_id: &str, status: &str) {
        if let Some(registration) = self.state().registrations.get_mut(service_id) {
            registration.status = status.to_string();
        }
    }

    /// Call every registered health check once and record UP or DOWN
    pub async fn probe_health_checks(&self) {
        let targets: Vec<(String, String)> = self
            .state()
            .registrations
            .values()
            .map(|r| {
                (
                    r.service_id.clone(),
                    format!(
                        "{}://{}:{}{}",
                        r.health_check.check_type, r.host, r.port, r.health_check.path
                    ),
                )
            })
            .collect();

        let client = reqwest::Client::new();
        for (service_id, url) in targets {
            let up = client
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            self.set_status(&service_id, if up { STATUS_UP } else { STATUS_DOWN });
        }
    }

    pub async fn request_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|r| r.len())
            .unwrap_or(0)
    }
}

/// A stand-in for the registering service, answering its health route
pub async fn start_service(route: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&server)
        .await;
    server
}
