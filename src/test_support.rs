//! Test-only helpers: token minting and a scripted in-memory transport.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::credential::Claims;
use crate::error::{ClientError, Result};
use crate::http::{OutboundRequest, RawResponse, Transport};
use crate::session::Session;
use crate::storage::LocalStore;

pub const TEST_SECRET: &[u8] = b"test_secret";

pub fn mint_token(sub: &str, email: &str, admin: bool) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        email: email.to_string(),
        is_admin: admin,
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(TEST_SECRET))
        .expect("encode test token")
}

/// Fresh session on a temporary store, optionally logged in.
pub fn session_as(sub: Option<(&str, bool)>) -> Arc<Session> {
    let session = Session::new(LocalStore::temporary().expect("temporary store"));
    if let Some((sub, admin)) = sub {
        session
            .establish(&mint_token(sub, &format!("{sub}@example.com"), admin))
            .expect("establish");
    }
    session
}

/// Gate for a held response: `issued` fires when the request arrives,
/// `release` lets the response go.
#[derive(Clone, Default)]
pub struct Hold {
    pub issued: Arc<Notify>,
    pub release: Arc<Notify>,
}

enum Reply {
    Response(RawResponse),
    Error(String),
    Held(RawResponse, Hold),
}

/// Replays queued replies per path (query string ignored) and records every
/// request it sees.
#[derive(Default)]
pub struct FakeTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    seen: Mutex<Vec<OutboundRequest>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, path: &str, reply: Reply) {
        self.replies
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn respond(&self, path: &str, response: RawResponse) {
        self.push(path, Reply::Response(response));
    }

    pub fn fail(&self, path: &str, message: &str) {
        self.push(path, Reply::Error(message.to_string()));
    }

    pub fn hold(&self, path: &str, response: RawResponse) -> Hold {
        let hold = Hold::default();
        self.push(path, Reply::Held(response, hold.clone()));
        hold
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.seen.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn paths(&self) -> Vec<String> {
        self.seen.lock().iter().map(|r| r.request.path.clone()).collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, req: OutboundRequest) -> Result<RawResponse> {
        let path = req.request.path.clone();
        self.seen.lock().push(req);
        let reply = self.replies.lock().get_mut(&path).and_then(|q| q.pop_front());
        match reply {
            Some(Reply::Response(r)) => Ok(r),
            Some(Reply::Error(msg)) => Err(ClientError::Transport(msg)),
            Some(Reply::Held(r, hold)) => {
                hold.issued.notify_one();
                hold.release.notified().await;
                Ok(r)
            }
            None => Ok(RawResponse::text(404, &format!("no scripted response for {path}"))),
        }
    }
}
