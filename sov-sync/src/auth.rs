//! Pushes bearer-token changes into the connection and the REST client.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::ApiClient;
use crate::connection::ConnectionHandle;

/// Forwards the current token; repeated values are ignored.
pub struct AuthTokenBridge {
    conn: ConnectionHandle,
    api: Option<Arc<ApiClient>>,
    last: Mutex<Option<String>>,
}

impl AuthTokenBridge {
    pub fn new(conn: ConnectionHandle) -> Self {
        Self {
            conn,
            api: None,
            last: Mutex::new(None),
        }
    }

    /// Also keep `api`'s bearer token in step.
    pub fn with_api(mut self, api: Arc<ApiClient>) -> Self {
        self.api = Some(api);
        self
    }

    /// Apply a token change. Returns false when `token` equals the last one.
    pub fn update(&self, token: Option<String>) -> bool {
        let token = token.filter(|t| !t.is_empty());
        {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if *last == token {
                return false;
            }
            *last = token.clone();
        }

        if let Some(api) = &self.api {
            api.set_token(token.clone());
        }
        match token {
            Some(token) => {
                log::debug!("bearer token updated");
                self.conn.authenticate(token);
            }
            None => {
                log::debug!("bearer token cleared");
                self.conn.clear_token();
            }
        }
        true
    }

    pub fn current(&self) -> Option<String> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Follow `tokens` until its sender is dropped.
    pub fn spawn(self, mut tokens: watch::Receiver<Option<String>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let token = tokens.borrow_and_update().clone();
                self.update(token);
                if tokens.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}
