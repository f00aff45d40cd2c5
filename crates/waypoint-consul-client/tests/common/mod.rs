//! In-process Consul double backed by wiremock
//!
//! Emulates just enough of the agent, health and KV endpoints for the client
//! tests. State is owned by each `MockConsul` instance.

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use percent_encoding::percent_decode_str;
use serde_json::json;
use waypoint_consul_client::{
    constants::{X_CONSUL_INDEX, X_CONSUL_TOKEN},
    model::{AgentCheckRegistration, AgentService, AgentServiceRegistration, HealthCheck, KVPair},
};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate, matchers::any};

/// How long a blocking query with an up-to-date index is held
const BLOCKING_HOLD: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
struct StoredCheck {
    check: HealthCheck,
    http: Option<String>,
}

#[derive(Default)]
struct ConsulState {
    index: u64,
    kv: BTreeMap<String, KVPair>,
    services: BTreeMap<String, AgentService>,
    checks: BTreeMap<String, StoredCheck>,
    required_token: Option<String>,
}

impl ConsulState {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }
}

struct ConsulResponder {
    state: Arc<Mutex<ConsulState>>,
}

fn query_param(request: &Request, name: &str) -> Option<String> {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Undo the percent-encoding the client applies to path segments
fn decode_path(path: &str) -> String {
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

fn with_index(template: ResponseTemplate, index: u64) -> ResponseTemplate {
    template.insert_header(X_CONSUL_INDEX, index.to_string().as_str())
}

impl ConsulResponder {
    fn handle_kv(&self, state: &mut ConsulState, request: &Request, key: &str) -> ResponseTemplate {
        match request.method.as_str() {
            "PUT" => {
                let index = state.bump();
                let mut pair = KVPair::new(key, &request.body, index);
                if let Some(existing) = state.kv.get(key) {
                    pair.create_index = existing.create_index;
                }
                state.kv.insert(key.to_string(), pair);
                ResponseTemplate::new(200).set_body_string("true")
            }
            "GET" if query_param(request, "keys").is_some() => {
                let keys: Vec<&String> = state.kv.keys().filter(|k| k.starts_with(key)).collect();
                if keys.is_empty() {
                    with_index(ResponseTemplate::new(404), state.index)
                } else {
                    with_index(ResponseTemplate::new(200).set_body_json(keys), state.index)
                }
            }
            "GET" if query_param(request, "recurse").is_some() => {
                let pairs: Vec<&KVPair> = state
                    .kv
                    .values()
                    .filter(|p| p.key.starts_with(key))
                    .collect();

                let template = if pairs.is_empty() {
                    ResponseTemplate::new(404)
                } else {
                    ResponseTemplate::new(200).set_body_json(pairs)
                };

                let requested = query_param(request, "index")
                    .and_then(|i| i.parse::<u64>().ok())
                    .unwrap_or(0);
                let template = if requested > 0 && requested >= state.index {
                    template.set_delay(BLOCKING_HOLD)
                } else {
                    template
                };
                with_index(template, state.index)
            }
            "GET" => match state.kv.get(key) {
                Some(pair) => with_index(
                    ResponseTemplate::new(200).set_body_json(vec![pair]),
                    state.index,
                ),
                None => with_index(ResponseTemplate::new(404), state.index),
            },
            _ => ResponseTemplate::new(405),
        }
    }
}

impl Respond for ConsulResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let path = decode_path(request.url.path());
        let method = request.method.as_str().to_string();

        if path == "/v1/agent/self" {
            return ResponseTemplate::new(200).set_body_json(json!({ "Config": {} }));
        }

        if let Some(required) = &state.required_token {
            let sent = request
                .headers
                .get(X_CONSUL_TOKEN)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if sent != required {
                return ResponseTemplate::new(403).set_body_string("ACL not found");
            }
        }

        if let Some(key) = path.strip_prefix("/v1/kv/") {
            return self.handle_kv(&mut state, request, key);
        }

        match (method.as_str(), path.as_str()) {
            ("PUT", "/v1/agent/service/register") => {
                let registration: AgentServiceRegistration =
                    match serde_json::from_slice(&request.body) {
                        Ok(r) => r,
                        Err(e) => return ResponseTemplate::new(400).set_body_string(e.to_string()),
                    };
                let id = registration
                    .id
                    .clone()
                    .unwrap_or_else(|| registration.name.clone());
                state.services.insert(
                    id.clone(),
                    AgentService {
                        id,
                        service: registration.name,
                        port: registration.port.unwrap_or_default(),
                        address: registration.address.unwrap_or_default(),
                    },
                );
                state.bump();
                ResponseTemplate::new(200)
            }
            ("PUT", "/v1/agent/check/register") => {
                let registration: AgentCheckRegistration =
                    match serde_json::from_slice(&request.body) {
                        Ok(r) => r,
                        Err(e) => return ResponseTemplate::new(400).set_body_string(e.to_string()),
                    };
                let id = registration
                    .id
                    .clone()
                    .unwrap_or_else(|| registration.name.clone());
                let service_id = registration.service_id.clone().unwrap_or_default();
                let service_name = state
                    .services
                    .get(&service_id)
                    .map(|s| s.service.clone())
                    .unwrap_or_default();
                state.checks.insert(
                    id.clone(),
                    StoredCheck {
                        check: HealthCheck {
                            node: "mock".to_string(),
                            check_id: id,
                            name: registration.name,
                            status: "critical".to_string(),
                            notes: registration.notes.unwrap_or_default(),
                            output: String::new(),
                            service_id,
                            service_name,
                        },
                        http: registration.check.http,
                    },
                );
                state.bump();
                ResponseTemplate::new(200)
            }
            ("PUT", p) if p.starts_with("/v1/agent/service/deregister/") => {
                let id = p.trim_start_matches("/v1/agent/service/deregister/");
                if state.services.remove(id).is_none() {
                    return ResponseTemplate::new(404)
                        .set_body_string(format!("Unknown service ID {:?}", id));
                }
                state.checks.retain(|_, c| c.check.service_id != id);
                state.bump();
                ResponseTemplate::new(200)
            }
            ("PUT", p) if p.starts_with("/v1/agent/check/deregister/") => {
                let id = p.trim_start_matches("/v1/agent/check/deregister/");
                if state.checks.remove(id).is_none() {
                    return ResponseTemplate::new(404)
                        .set_body_string(format!("Unknown check ID {:?}", id));
                }
                state.bump();
                ResponseTemplate::new(200)
            }
            ("GET", "/v1/agent/services") => {
                ResponseTemplate::new(200).set_body_json(&state.services)
            }
            ("GET", p) if p.starts_with("/v1/health/checks/") => {
                let service = p.trim_start_matches("/v1/health/checks/");
                let checks: Vec<&HealthCheck> = state
                    .checks
                    .values()
                    .map(|c| &c.check)
                    .filter(|c| c.service_id == service)
                    .collect();
                with_index(ResponseTemplate::new(200).set_body_json(checks), state.index)
            }
            _ => ResponseTemplate::new(404).set_body_string("unknown endpoint"),
        }
    }
}

pub struct MockConsul {
    server: MockServer,
    state: Arc<Mutex<ConsulState>>,
}

impl MockConsul {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(ConsulState::default()));

        Mock::given(any())
            .respond_with(ConsulResponder {
                state: state.clone(),
            })
            .mount(&server)
            .await;

        Self { server, state }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ConsulState> {
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

    /// Reject every request that does not carry `token`
    pub fn require_token(&self, token: &str) {
        self.state().required_token = Some(token.to_string());
    }

    pub fn put_raw(&self, key: &str, value: &str) {
        let mut state = self.state();
        let index = state.bump();
        state
            .kv
            .insert(key.to_string(), KVPair::new(key, value.as_bytes(), index));
    }

    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.state()
            .kv
            .get(key)
            .and_then(|p| p.decoded_value().ok())
            .map(|v| String::from_utf8_lossy(&v).into_owned())
    }

    pub fn modify_index(&self, key: &str) -> Option<u64> {
        self.state().kv.get(key).map(|p| p.modify_index)
    }

    pub fn has_service(&self, id: &str) -> bool {
        self.state().services.contains_key(id)
    }

    pub fn check(&self, id: &str) -> Option<HealthCheck> {
        self.state().checks.get(id).map(|c| c.check.clone())
    }

    pub fn check_url(&self, id: &str) -> Option<String> {
        self.state().checks.get(id).and_then(|c| c.http.clone())
    }

    pub fn set_check_status(&self, id: &str, status: &str) {
        if let Some(stored) = self.state().checks.get_mut(id) {
            stored.check.status = status.to_string();
        }
    }

    /// Run every HTTP check once, as the agent would on its interval
    pub async fn probe_health_checks(&self) {
        let targets: Vec<(String, Option<String>)> = self
            .state()
            .checks
            .iter()
            .map(|(id, c)| (id.clone(), c.http.clone()))
            .collect();

        let client = reqwest::Client::new();
        for (id, url) in targets {
            let passing = match url {
                Some(url) => client
                    .get(&url)
                    .timeout(Duration::from_secs(2))
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false),
                None => false,
            };
            self.set_check_status(&id, if passing { "passing" } else { "critical" });
        }
    }

    /// Number of requests the mock has received
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
