//! Shared helpers: a real SQLite store in a temp dir, in-process connections,
//! and frame decoding.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use chatverse_server::auth::JwtVerifier;
use chatverse_server::db::models::GroupRecord;
use chatverse_server::db::{self, DbPool, SqliteStore};
use chatverse_server::groups::membership::{self, GroupDraft};
use chatverse_server::presence::coordinator::{self, Session};
use chatverse_server::state::{AppState, Settings};
use chatverse_server::ws::ConnectionHandle;

pub const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

pub struct Harness {
    pub state: AppState,
    pub store: SqliteStore,
    pub db: DbPool,
    pub data_dir: String,
    _tmp: tempfile::TempDir,
}

/// Fresh store seeded with alice, bob, carol and dave.
pub fn harness() -> Harness {
    harness_with(Settings::default())
}

pub fn harness_with(settings: Settings) -> Harness {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp.path().to_str().unwrap().to_string();
    let db = db::init_db(&data_dir).expect("Failed to init DB");
    let store = SqliteStore::new(db.clone());
    for (id, name) in [
        ("alice", "Alice"),
        ("bob", "Bob"),
        ("carol", "Carol"),
        ("dave", "Dave"),
    ] {
        store.upsert_user(id, name, "").unwrap();
    }

    let state = AppState::new(store.clone(), Arc::new(JwtVerifier::new(SECRET)), settings);
    Harness {
        state,
        store,
        db,
        data_dir,
        _tmp: tmp,
    }
}

/// An in-process connection: the session plus the far end of its stream.
pub struct Client {
    pub session: Session,
    pub rx: UnboundedReceiver<Message>,
}

impl Client {
    pub fn id(&self) -> &str {
        self.session.user_id()
    }

    /// Every frame queued so far, decoded.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        out
    }

    /// Payloads of queued frames named `event`; other frames are discarded.
    pub fn events(&mut self, event: &str) -> Vec<Value> {
        self.drain()
            .into_iter()
            .filter(|v| v["event"] == event)
            .map(|v| v["data"].clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.drain();
    }
}

pub async fn connect(h: &Harness, user_id: &str) -> Client {
    let (handle, rx) = ConnectionHandle::channel();
    let session = coordinator::connect(&h.state, user_id, handle)
        .await
        .expect("connect failed");
    Client { session, rx }
}

pub async fn create_group(
    h: &Harness,
    creator: &Client,
    handle: &str,
    members: &[&str],
    is_private: bool,
) -> GroupRecord {
    membership::create_group(
        &h.state,
        &creator.session,
        GroupDraft {
            name: handle.to_uppercase(),
            handle: handle.to_string(),
            description: format!("{handle} group"),
            members: members.iter().map(|m| m.to_string()).collect(),
            is_private,
            group_icon: None,
        },
    )
    .await
    .expect("create_group failed")
}

pub fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

pub fn ids(values: &Value) -> Vec<String> {
    values
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

pub fn short_timeout() -> Settings {
    Settings {
        store_timeout: Duration::from_millis(100),
        ..Settings::default()
    }
}
