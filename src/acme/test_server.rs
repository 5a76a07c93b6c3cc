//! Stateful in-process ACME server for tests.
//!
//! Speaks just enough RFC 8555 to walk an order through DNS-01 validation and issuance. Nothing
//! is verified; signatures and proofs are accepted as they come.

use std::{
    convert::Infallible,
    net::TcpListener,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use actix_http::{body::BoxBody, HttpService, Method, Request, Response, StatusCode};
use actix_server::{Server, ServerHandle};
use base64::prelude::*;
use futures::StreamExt as _;
use parking_lot::Mutex;
use serde_json::{json, Value};

#[derive(Debug, Clone, Default)]
pub(crate) struct AcmeServerOptions {
    /// Every challenge ends up `invalid`.
    pub reject_challenge: bool,

    /// Number of finalize calls answered with 429 before one succeeds.
    pub rate_limit_finalize: usize,

    /// The first newOrder call fails with `badNonce`.
    pub bad_nonce_once: bool,

    /// Number of certificate downloads answered with 500 before one succeeds.
    pub fail_certificate_download: usize,
}

pub(crate) struct AcmeTestServer {
    pub dir_url: String,
    state: Arc<State>,
    handle: ServerHandle,
}

impl AcmeTestServer {
    pub(crate) fn revocations(&self) -> usize {
        self.state.revocations.load(Ordering::SeqCst)
    }

    /// Finalize calls the server accepted.
    pub(crate) fn finalized(&self) -> usize {
        self.state.finalized.load(Ordering::SeqCst)
    }
}

impl Drop for AcmeTestServer {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

#[derive(Debug)]
struct TestOrder {
    identifiers: Vec<String>,
    authz: Vec<&'static str>,
    certificate: Option<String>,
}

impl TestOrder {
    fn status(&self) -> &'static str {
        if self.certificate.is_some() {
            "valid"
        } else if self.authz.iter().any(|s| *s == "invalid") {
            "invalid"
        } else if self.authz.iter().all(|s| *s == "valid") {
            "ready"
        } else {
            "pending"
        }
    }
}

struct State {
    url: String,
    opts: Mutex<AcmeServerOptions>,
    orders: Mutex<Vec<TestOrder>>,
    nonces: AtomicUsize,
    revocations: AtomicUsize,
    finalized: AtomicUsize,
}

impl State {
    fn nonce(&self) -> String {
        format!("nonce-{}", self.nonces.fetch_add(1, Ordering::SeqCst))
    }

    fn reply(&self, status: StatusCode, body: Value) -> Response<BoxBody> {
        Response::build(status)
            .insert_header(("Replay-Nonce", self.nonce()))
            .insert_header(("Content-Type", "application/json"))
            .body(body.to_string())
            .map_into_boxed_body()
    }

    fn problem(&self, status: StatusCode, kind: &str, detail: &str) -> Response<BoxBody> {
        Response::build(status)
            .insert_header(("Replay-Nonce", self.nonce()))
            .insert_header(("Content-Type", "application/problem+json"))
            .insert_header(("Retry-After", "1"))
            .body(
                json!({
                    "type": format!("urn:ietf:params:acme:error:{kind}"),
                    "detail": detail,
                })
                .to_string(),
            )
            .map_into_boxed_body()
    }

    fn directory(&self) -> Response<BoxBody> {
        let url = &self.url;
        self.reply(
            StatusCode::OK,
            json!({
                "newNonce": format!("{url}/acme/new-nonce"),
                "newAccount": format!("{url}/acme/new-acct"),
                "newOrder": format!("{url}/acme/new-order"),
                "revokeCert": format!("{url}/acme/revoke-cert"),
                "keyChange": format!("{url}/acme/key-change"),
                "meta": { "caaIdentities": ["testdir.org"] }
            }),
        )
    }

    fn order_json(&self, id: usize, order: &TestOrder) -> Value {
        let url = &self.url;
        let status = order.status();

        let mut body = json!({
            "status": status,
            "identifiers": order
                .identifiers
                .iter()
                .map(|value| json!({ "type": "dns", "value": value }))
                .collect::<Vec<_>>(),
            "authorizations": (0..order.identifiers.len())
                .map(|idx| format!("{url}/acme/authz/{id}/{idx}"))
                .collect::<Vec<_>>(),
            "finalize": format!("{url}/acme/finalize/{id}"),
        });

        if order.certificate.is_some() {
            body["certificate"] = json!(format!("{url}/acme/cert/{id}"));
        }

        body
    }

    fn authz_json(&self, id: usize, idx: usize, order: &TestOrder) -> Value {
        let identifier = &order.identifiers[idx];
        let status = order.authz[idx];
        let (value, wildcard) = match identifier.strip_prefix("*.") {
            Some(base) => (base, true),
            None => (identifier.as_str(), false),
        };

        let mut challenge = json!({
            "type": "dns-01",
            "status": status,
            "url": format!("{}/acme/chall/{id}/{idx}", self.url),
            "token": format!("token-{id}-{idx}"),
        });

        if status == "invalid" {
            challenge["error"] = json!({
                "type": "urn:ietf:params:acme:error:incorrectTXT",
                "detail": format!("no TXT record found at _acme-challenge.{value}"),
            });
        }

        json!({
            "identifier": { "type": "dns", "value": value },
            "status": status,
            "wildcard": wildcard,
            "challenges": [
                {
                    "type": "http-01",
                    "status": "pending",
                    "url": format!("{}/acme/chall/{id}/{idx}/http", self.url),
                    "token": "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w"
                },
                challenge
            ],
        })
    }

    async fn route(&self, mut req: Request) -> Response<BoxBody> {
        let method = req.method().clone();
        let path = req.path().to_owned();

        let mut body = Vec::new();
        let mut payload = req.take_payload();
        while let Some(Ok(chunk)) = payload.next().await {
            body.extend_from_slice(&chunk);
        }

        let segments = path
            .trim_start_matches('/')
            .split('/')
            .collect::<Vec<_>>();

        let num = |idx: usize| segments.get(idx).and_then(|s| s.parse::<usize>().ok());

        match (method, segments.as_slice()) {
            (Method::GET, ["directory"]) => self.directory(),

            (Method::HEAD, ["acme", "new-nonce"]) => Response::build(StatusCode::OK)
                .insert_header(("Replay-Nonce", self.nonce()))
                .finish()
                .map_into_boxed_body(),

            (Method::POST, ["acme", "new-acct"]) => {
                let mut res = self.reply(StatusCode::CREATED, json!({ "status": "valid" }));
                res.headers_mut().insert(
                    actix_http::header::LOCATION,
                    actix_http::header::HeaderValue::from_str(&format!(
                        "{}/acme/acct/1",
                        self.url
                    ))
                    .unwrap(),
                );
                res
            }

            (Method::POST, ["acme", "new-order"]) => {
                {
                    let mut opts = self.opts.lock();
                    if opts.bad_nonce_once {
                        opts.bad_nonce_once = false;
                        return self.problem(StatusCode::BAD_REQUEST, "badNonce", "stale nonce");
                    }
                }

                let identifiers = jws_payload(&body)["identifiers"]
                    .as_array()
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|id| id["value"].as_str().map(ToOwned::to_owned))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();

                let order = TestOrder {
                    authz: vec!["pending"; identifiers.len()],
                    identifiers,
                    certificate: None,
                };

                let mut orders = self.orders.lock();
                let id = orders.len();
                let json = self.order_json(id, &order);
                orders.push(order);

                let mut res = self.reply(StatusCode::CREATED, json);
                res.headers_mut().insert(
                    actix_http::header::LOCATION,
                    actix_http::header::HeaderValue::from_str(&format!(
                        "{}/acme/order/{id}",
                        self.url
                    ))
                    .unwrap(),
                );
                res
            }

            (Method::POST, ["acme", "order", _]) => {
                let orders = self.orders.lock();
                match num(2).and_then(|id| orders.get(id).map(|o| (id, o))) {
                    Some((id, order)) => self.reply(StatusCode::OK, self.order_json(id, order)),
                    None => self.problem(StatusCode::NOT_FOUND, "malformed", "no such order"),
                }
            }

            (Method::POST, ["acme", "authz", _, _]) => {
                let orders = self.orders.lock();
                match (num(2), num(3)) {
                    (Some(id), Some(idx))
                        if orders.get(id).is_some_and(|o| idx < o.authz.len()) =>
                    {
                        self.reply(StatusCode::OK, self.authz_json(id, idx, &orders[id]))
                    }
                    _ => self.problem(StatusCode::NOT_FOUND, "malformed", "no such authz"),
                }
            }

            (Method::POST, ["acme", "chall", _, _]) => {
                let reject = self.opts.lock().reject_challenge;
                let mut orders = self.orders.lock();
                match (num(2), num(3)) {
                    (Some(id), Some(idx))
                        if orders.get(id).is_some_and(|o| idx < o.authz.len()) =>
                    {
                        orders[id].authz[idx] = if reject { "invalid" } else { "valid" };
                        self.reply(StatusCode::OK, json!({ "status": "processing" }))
                    }
                    _ => self.problem(StatusCode::NOT_FOUND, "malformed", "no such challenge"),
                }
            }

            (Method::POST, ["acme", "finalize", _]) => {
                {
                    let mut opts = self.opts.lock();
                    if opts.rate_limit_finalize > 0 {
                        opts.rate_limit_finalize -= 1;
                        return self.problem(
                            StatusCode::TOO_MANY_REQUESTS,
                            "rateLimited",
                            "too many certificates already issued",
                        );
                    }
                }

                let mut orders = self.orders.lock();
                let Some(id) = num(2).filter(|id| *id < orders.len()) else {
                    return self.problem(StatusCode::NOT_FOUND, "malformed", "no such order");
                };

                let status = orders[id].status();
                if status != "ready" {
                    return self.problem(
                        StatusCode::FORBIDDEN,
                        "orderNotReady",
                        &format!("order is {status}"),
                    );
                }

                let sans = orders[id].identifiers.clone();
                let cert = rcgen::generate_simple_self_signed(sans).unwrap();
                orders[id].certificate = Some(cert.cert.pem());
                self.finalized.fetch_add(1, Ordering::SeqCst);

                let json = self.order_json(id, &orders[id]);
                self.reply(StatusCode::OK, json)
            }

            (Method::POST, ["acme", "cert", _]) => {
                {
                    let mut opts = self.opts.lock();
                    if opts.fail_certificate_download > 0 {
                        opts.fail_certificate_download -= 1;
                        return self.problem(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "serverInternal",
                            "certificate storage unavailable",
                        );
                    }
                }

                let orders = self.orders.lock();
                match num(2).and_then(|id| orders.get(id)?.certificate.clone()) {
                    Some(pem) => Response::build(StatusCode::OK)
                        .insert_header(("Replay-Nonce", self.nonce()))
                        .insert_header(("Content-Type", "application/pem-certificate-chain"))
                        .body(pem)
                        .map_into_boxed_body(),
                    None => self.problem(StatusCode::NOT_FOUND, "malformed", "no certificate"),
                }
            }

            (Method::POST, ["acme", "revoke-cert"]) => {
                self.revocations.fetch_add(1, Ordering::SeqCst);
                self.reply(StatusCode::OK, Value::Null)
            }

            _ => Response::build(StatusCode::NOT_FOUND)
                .finish()
                .map_into_boxed_body(),
        }
    }
}

/// Decodes the payload of a flattened JWS body; `Null` for POST-as-GET.
fn jws_payload(body: &[u8]) -> Value {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|jws| {
            let payload = BASE64_URL_SAFE_NO_PAD
                .decode(jws["payload"].as_str()?)
                .ok()?;
            serde_json::from_slice(&payload).ok()
        })
        .unwrap_or(Value::Null)
}

pub(crate) fn with_acme_server(opts: AcmeServerOptions) -> AcmeTestServer {
    let lst = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = lst.local_addr().unwrap().port();

    let url = format!("http://127.0.0.1:{port}");
    let dir_url = format!("{url}/directory");

    let state = Arc::new(State {
        url,
        opts: Mutex::new(opts),
        orders: Mutex::new(Vec::new()),
        nonces: AtomicUsize::new(0),
        revocations: AtomicUsize::new(0),
        finalized: AtomicUsize::new(0),
    });

    let server_state = Arc::clone(&state);
    let server = Server::build()
        .listen("acme", lst, move || {
            let state = Arc::clone(&server_state);

            HttpService::build()
                .finish(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(state.route(req).await) }
                })
                .tcp()
        })
        .unwrap()
        .workers(1)
        .run();

    let handle = server.handle();

    tokio::spawn(server);

    AcmeTestServer {
        dir_url,
        state,
        handle,
    }
}

#[tokio::test]
async fn serves_directory() {
    let server = with_acme_server(AcmeServerOptions::default());
    let res = reqwest::get(&server.dir_url).await.unwrap();
    assert!(res.status().is_success());

    let dir: crate::acme::api::Directory = res.json().await.unwrap();
    assert!(dir.new_order.ends_with("/acme/new-order"));
}

#[tokio::test]
async fn finalize_requires_ready_order() {
    let server = with_acme_server(AcmeServerOptions::default());
    let base = server.dir_url.trim_end_matches("/directory").to_owned();
    let client = reqwest::Client::new();

    let payload = BASE64_URL_SAFE_NO_PAD
        .encode(json!({ "identifiers": [{ "type": "dns", "value": "example.com" }] }).to_string());
    let res = client
        .post(format!("{base}/acme/new-order"))
        .body(json!({ "payload": payload }).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::CREATED);

    let res = client
        .post(format!("{base}/acme/finalize/0"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::FORBIDDEN);

    let problem = res.json::<Value>().await.unwrap();
    assert_eq!(problem["type"], "urn:ietf:params:acme:error:orderNotReady");
    assert_eq!(server.finalized(), 0);
}
