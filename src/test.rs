#![allow(clippy::trivial_regex)]

use std::{
    collections::HashMap,
    convert::Infallible,
    future::ready,
    net::TcpListener,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use actix_http::{HttpService, Method, Request, Response, StatusCode};
use actix_server::{Server, ServerHandle};
use actix_web::body::MessageBody;
use parking_lot::Mutex;
use regex::Regex;

static RE_URL: OnceLock<Regex> = OnceLock::new();

fn re_url() -> &'static Regex {
    RE_URL.get_or_init(|| Regex::new("<URL>").unwrap())
}

/// Canned server behavior for one test.
pub(crate) struct Scenario {
    /// Reject this many newOrder posts with `badNonce` before accepting.
    pub(crate) bad_nonces: usize,

    /// Statuses successive order polls report; the last one repeats.
    pub(crate) order_status_seq: Vec<&'static str>,

    /// Statuses successive challenge posts report; the last one repeats.
    pub(crate) challenge_status_seq: Vec<&'static str>,

    /// Status of the order's authorization.
    pub(crate) authz_status: &'static str,

    /// PEM chain the certificate endpoint serves.
    pub(crate) cert_pem: String,
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario {
            bad_nonces: 0,
            order_status_seq: vec!["valid"],
            challenge_status_seq: vec!["valid"],
            authz_status: "pending",
            cert_pem: String::new(),
        }
    }
}

/// Observable side of the test server.
#[derive(Default)]
pub(crate) struct TestState {
    directory_fetches: AtomicUsize,
    new_order_posts: AtomicUsize,
    order_polls: AtomicUsize,
    challenge_polls: AtomicUsize,
    account_created: AtomicBool,
    revoked: AtomicBool,
    challenge_files: Mutex<HashMap<String, String>>,
}

impl TestState {
    pub(crate) fn directory_fetches(&self) -> usize {
        self.directory_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn new_order_posts(&self) -> usize {
        self.new_order_posts.load(Ordering::SeqCst)
    }

    pub(crate) fn order_polls(&self) -> usize {
        self.order_polls.load(Ordering::SeqCst)
    }

    pub(crate) fn challenge_polls(&self) -> usize {
        self.challenge_polls.load(Ordering::SeqCst)
    }

    pub(crate) fn put_challenge_file(&self, token: &str, content: &str) {
        self.challenge_files
            .lock()
            .insert(token.to_owned(), content.to_owned());
    }

    pub(crate) fn remove_challenge_file(&self, token: &str) {
        self.challenge_files.lock().remove(token);
    }

    pub(crate) fn challenge_file_count(&self) -> usize {
        self.challenge_files.lock().len()
    }
}

pub(crate) struct TestServer {
    pub(crate) dir_url: String,
    pub(crate) port: u16,
    pub(crate) state: Arc<TestState>,
    base_url: String,
    handle: ServerHandle,
}

impl TestServer {
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

fn get_directory(url: &str) -> Response<impl MessageBody> {
    const BODY: &str = r#"{
    "keyChange": "<URL>/acme/key-change",
    "newAccount": "<URL>/acme/new-acct",
    "newNonce": "<URL>/acme/new-nonce",
    "newOrder": "<URL>/acme/new-order",
    "revokeCert": "<URL>/acme/revoke-cert",
    "meta": {
        "termsOfService": "<URL>/terms",
        "caaIdentities": [
        "testdir.org"
        ]
    }
    }"#;

    Response::with_body(StatusCode::OK, re_url().replace_all(BODY, url))
}

fn head_new_nonce() -> Response<impl MessageBody> {
    Response::build(StatusCode::NO_CONTENT)
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .finish()
}

fn fresh_nonce() -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!("nonce-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

fn bad_nonce(url: &str) -> Response<impl MessageBody> {
    const BODY: &str = r#"{
    "type": "urn:ietf:params:acme:error:badNonce",
    "detail": "JWS has an invalid anti-replay nonce",
    "status": 400
    }"#;

    Response::build(StatusCode::BAD_REQUEST)
        .insert_header(("content-type", "application/problem+json"))
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body(re_url().replace_all(BODY, url))
}

fn account_body() -> &'static str {
    r#"{
    "key": {
        "use": "sig",
        "kty": "EC",
        "crv": "P-256",
        "alg": "ES256",
        "x": "ttpobTRK2bw7ttGBESRO7Nb23mbIRfnRZwunL1W6wRI",
        "y": "h2Z00J37_2qRKH0-flrHEsH0xbit915Tyvd2v_CAOSk"
    },
    "contact": [
        "mailto:foo@bar.com"
    ],
    "status": "valid"
    }"#
}

fn post_new_acct(url: &str, state: &TestState) -> Response<impl MessageBody> {
    let location = re_url()
        .replace_all("<URL>/acme/acct/7728515", url)
        .into_owned();

    // 201 on first registration, 200 when the key is already known
    let status = if state.account_created.swap(true, Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Response::build(status)
        .insert_header(("Location", location))
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body(account_body())
}

fn post_acct(_url: &str) -> Response<impl MessageBody> {
    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body(account_body())
}

fn post_key_change() -> Response<impl MessageBody> {
    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body("{}")
}

fn post_new_order(url: &str, state: &TestState, scenario: &Scenario) -> Response<impl MessageBody> {
    const BODY: &str = r#"{
    "status": "pending",
    "expires": "2019-01-09T08:26:43.570360537Z",
    "identifiers": [
        {
        "type": "dns",
        "value": "example.test"
        }
    ],
    "authorizations": [
        "<URL>/acme/authz/1"
    ],
    "finalize": "<URL>/acme/finalize/1"
    }"#;

    let posts = state.new_order_posts.fetch_add(1, Ordering::SeqCst) + 1;
    if posts <= scenario.bad_nonces {
        return bad_nonce(url).map_into_boxed_body();
    }

    let location = re_url().replace_all("<URL>/acme/order/1", url).into_owned();

    Response::build(StatusCode::CREATED)
        .insert_header(("Location", location))
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body(re_url().replace_all(BODY, url))
        .map_into_boxed_body()
}

fn order_body(url: &str, status: &str) -> String {
    const BODY: &str = r#"{
    "status": "<STATUS>",
    "expires": "2019-01-09T08:26:43.570360537Z",
    "identifiers": [
        {
        "type": "dns",
        "value": "example.test"
        }
    ],
    "authorizations": [
        "<URL>/acme/authz/1"
    ],
    "finalize": "<URL>/acme/finalize/1",
    "certificate": "<URL>/acme/cert/1"
    }"#;

    re_url()
        .replace_all(BODY, url)
        .replace("<STATUS>", status)
}

fn seq_status<'a>(seq: &'a [&'a str], nth: usize) -> &'a str {
    seq.get(nth.saturating_sub(1))
        .or_else(|| seq.last())
        .copied()
        .unwrap_or("valid")
}

fn post_get_order(url: &str, state: &TestState, scenario: &Scenario) -> Response<impl MessageBody> {
    let polls = state.order_polls.fetch_add(1, Ordering::SeqCst) + 1;
    let status = seq_status(&scenario.order_status_seq, polls);

    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body(order_body(url, status))
}

fn post_authz(url: &str, scenario: &Scenario) -> Response<impl MessageBody> {
    const BODY: &str = r#"{
        "identifier": {
            "type": "dns",
            "value": "example.test"
        },
        "status": "<STATUS>",
        "expires": "2019-01-09T08:26:43Z",
        "challenges": [
        {
            "type": "http-01",
            "status": "pending",
            "url": "<URL>/acme/challenge/1",
            "token": "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w"
        },
        {
            "type": "tls-alpn-01",
            "status": "pending",
            "url": "<URL>/acme/challenge/2",
            "token": "WCdRWkCy4THTD_j5IH4ISAzr59lFIg5wzYmKxuOJ1lU"
        },
        {
            "type": "dns-01",
            "status": "pending",
            "url": "<URL>/acme/challenge/3",
            "token": "RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8"
        }
        ]
    }"#;

    let body = re_url()
        .replace_all(BODY, url)
        .replace("<STATUS>", scenario.authz_status);

    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body(body)
}

fn post_challenge(url: &str, state: &TestState, scenario: &Scenario) -> Response<impl MessageBody> {
    const BODY: &str = r#"{
    "type": "http-01",
    "status": "<STATUS>",
    "url": "<URL>/acme/challenge/1",
    "token": "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w"
    }"#;

    let polls = state.challenge_polls.fetch_add(1, Ordering::SeqCst) + 1;
    let status = seq_status(&scenario.challenge_status_seq, polls);

    let body = re_url().replace_all(BODY, url).replace("<STATUS>", status);

    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body(body)
}

fn post_finalize(url: &str) -> Response<impl MessageBody> {
    let location = re_url().replace_all("<URL>/acme/order/1", url).into_owned();

    Response::build(StatusCode::OK)
        .insert_header(("Location", location))
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body(order_body(url, "valid"))
}

fn post_certificate(url: &str, state: &TestState, scenario: &Scenario) -> Response<impl MessageBody> {
    if state.revoked.load(Ordering::SeqCst) {
        const BODY: &str = r#"{
        "type": "urn:ietf:params:acme:error:unauthorized",
        "detail": "Certificate has been revoked",
        "status": 404
        }"#;

        return Response::build(StatusCode::NOT_FOUND)
            .insert_header(("content-type", "application/problem+json"))
            .insert_header(("Replay-Nonce", fresh_nonce()))
            .body(re_url().replace_all(BODY, url))
            .map_into_boxed_body();
    }

    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body(scenario.cert_pem.clone())
        .map_into_boxed_body()
}

fn post_revoke_cert(url: &str, state: &TestState) -> Response<impl MessageBody> {
    if state.revoked.swap(true, Ordering::SeqCst) {
        const BODY: &str = r#"{
        "type": "urn:ietf:params:acme:error:alreadyRevoked",
        "detail": "Certificate already revoked",
        "status": 400
        }"#;

        return Response::build(StatusCode::BAD_REQUEST)
            .insert_header(("content-type", "application/problem+json"))
            .insert_header(("Replay-Nonce", fresh_nonce()))
            .body(re_url().replace_all(BODY, url))
            .map_into_boxed_body();
    }

    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", fresh_nonce()))
        .body("{}")
        .map_into_boxed_body()
}

fn get_challenge_file(token: &str, state: &TestState) -> Response<impl MessageBody> {
    match state.challenge_files.lock().get(token) {
        Some(content) => Response::build(StatusCode::OK).body(content.clone()),
        None => Response::build(StatusCode::NOT_FOUND).body(String::new()),
    }
}

fn route_request(
    req: Request,
    url: &str,
    state: &TestState,
    scenario: &Scenario,
) -> Response<impl MessageBody> {
    match (req.method(), req.path()) {
        (&Method::GET, "/directory") => {
            state.directory_fetches.fetch_add(1, Ordering::SeqCst);
            get_directory(url).map_into_boxed_body()
        }

        (&Method::HEAD, "/acme/new-nonce") => head_new_nonce().map_into_boxed_body(),

        (&Method::POST, "/acme/new-acct") => post_new_acct(url, state).map_into_boxed_body(),
        (&Method::POST, "/acme/acct/7728515") => post_acct(url).map_into_boxed_body(),
        (&Method::POST, "/acme/key-change") => post_key_change().map_into_boxed_body(),

        (&Method::POST, "/acme/new-order") => {
            post_new_order(url, state, scenario).map_into_boxed_body()
        }
        (&Method::POST, "/acme/order/1") => {
            post_get_order(url, state, scenario).map_into_boxed_body()
        }

        (&Method::POST, "/acme/authz/1") => post_authz(url, scenario).map_into_boxed_body(),

        (&Method::POST, path) if path.starts_with("/acme/challenge/") => {
            post_challenge(url, state, scenario).map_into_boxed_body()
        }

        (&Method::POST, "/acme/finalize/1") => post_finalize(url).map_into_boxed_body(),
        (&Method::POST, "/acme/cert/1") => {
            post_certificate(url, state, scenario).map_into_boxed_body()
        }
        (&Method::POST, "/acme/revoke-cert") => {
            post_revoke_cert(url, state).map_into_boxed_body()
        }

        (&Method::GET, path) if path.starts_with("/.well-known/acme-challenge/") => {
            let token = &path["/.well-known/acme-challenge/".len()..];
            get_challenge_file(token, state).map_into_boxed_body()
        }

        (_, _) => Response::build(StatusCode::NOT_FOUND)
            .finish()
            .map_into_boxed_body(),
    }
}

pub(crate) fn with_directory_server() -> TestServer {
    with_scenario(Scenario::default())
}

pub(crate) fn with_scenario(scenario: Scenario) -> TestServer {
    let _ = env_logger::builder().is_test(true).try_init();

    let lst = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = lst.local_addr().unwrap().port();

    let url = format!("http://127.0.0.1:{port}");
    let dir_url = format!("{url}/directory");

    let state = Arc::new(TestState::default());
    let scenario = Arc::new(scenario);

    let server = {
        let state = Arc::clone(&state);
        let base_url = url.clone();

        Server::build()
            .listen("acme", lst, move || {
                let url = base_url.clone();
                let state = Arc::clone(&state);
                let scenario = Arc::clone(&scenario);

                HttpService::build()
                    .finish(move |req| {
                        ready(Ok::<_, Infallible>(route_request(
                            req, &url, &state, &scenario,
                        )))
                    })
                    .tcp()
            })
            .unwrap()
            .workers(1)
            .run()
    };

    let handle = server.handle();

    tokio::spawn(server);

    TestServer {
        dir_url,
        port,
        state,
        base_url: url,
        handle,
    }
}

#[tokio::test]
pub async fn test_make_directory() {
    let server = with_directory_server();
    let res = reqwest::get(&server.dir_url).await.unwrap();
    assert!(res.status().is_success());
}
