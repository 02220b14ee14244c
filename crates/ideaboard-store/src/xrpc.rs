//! XRPC store: record CRUD and sessions against an ATProto PDS.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use crate::{
    CurrentUser, IdentityProvider, PROFILE_COLLECTION, PROFILE_KEY, RecordRef, RecordStore,
    StoreError, StoredRecord, Tid,
};

/// Retries after the first attempt for transient upstream failures.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Page size used when listing a collection.
const PAGE_SIZE: u32 = 100;

/// Session information from authentication.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    did: String,
    handle: String,
    access_jwt: String,
    refresh_jwt: String,
}

/// Response from `createRecord` and `putRecord`.
#[derive(Debug, Deserialize)]
struct WriteRecordResponse {
    uri: String,
    cid: String,
}

/// Response from `listRecords`.
#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    records: Vec<ListRecordItem>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListRecordItem {
    uri: String,
    cid: String,
    value: Value,
}

/// Response from `getRecord`.
#[derive(Debug, Deserialize)]
struct GetRecordResponse {
    value: Value,
}

/// XRPC error response format.
#[derive(Debug, Deserialize)]
struct XrpcError {
    error: String,
    #[serde(default)]
    message: String,
}

/// Record store and identity provider backed by a PDS.
pub struct XrpcStore {
    http: Client,
    pds_url: String,
    session: RwLock<Option<Session>>,
    user_tx: watch::Sender<Option<CurrentUser>>,
    max_retries: u32,
}

impl XrpcStore {
    /// Create a new store for the given PDS URL.
    pub fn new(pds_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        let (user_tx, _) = watch::channel(None);

        Self {
            http,
            pds_url: pds_url.into().trim_end_matches('/').to_string(),
            session: RwLock::new(None),
            user_tx,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Set how many times a transient failure is retried.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Get the PDS URL.
    pub fn pds_url(&self) -> &str {
        &self.pds_url
    }

    /// Get the current session DID.
    pub async fn did(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.did.clone())
    }

    /// Get the current session handle.
    pub async fn handle(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.handle.clone())
    }

    async fn require_did(&self) -> Result<String, StoreError> {
        self.did()
            .await
            .ok_or_else(|| StoreError::Auth("not authenticated".to_string()))
    }

    async fn access_token(&self) -> Result<String, StoreError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_jwt.clone())
            .ok_or_else(|| StoreError::Auth("not authenticated".to_string()))
    }

    fn endpoint(&self, nsid: &str) -> String {
        format!("{}/xrpc/{}", self.pds_url, nsid)
    }

    /// Refresh the current session tokens.
    pub async fn refresh_session(&self) -> Result<(), StoreError> {
        let refresh_jwt = {
            let session = self.session.read().await;
            session
                .as_ref()
                .map(|s| s.refresh_jwt.clone())
                .ok_or_else(|| StoreError::Auth("no session to refresh".to_string()))?
        };

        let response = self
            .http
            .post(self.endpoint("com.atproto.server.refreshSession"))
            .bearer_auth(refresh_jwt)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!(
                "refresh failed ({}): {}",
                status, text
            )));
        }

        let session: Session = response.json().await?;
        debug!(did = %session.did, "refreshed session");

        *self.session.write().await = Some(session);
        Ok(())
    }

    async fn try_refresh(&self) -> bool {
        match self.refresh_session().await {
            Ok(()) => {
                debug!("automatically refreshed expired session");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to auto-refresh session");
                false
            }
        }
    }

    /// Issue an authenticated XRPC call.
    ///
    /// An expired token is refreshed once. Transient upstream failures are
    /// retried with 500ms doubling backoff up to `max_retries` times.
    async fn call<T, F>(
        &self,
        nsid: &'static str,
        target: Option<&RecordRef>,
        build: F,
    ) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let url = self.endpoint(nsid);
        let mut refreshed = false;
        let mut attempt = 0;

        loop {
            let token = self.access_token().await?;

            let result = match build(&self.http, url.as_str()).bearer_auth(&token).send().await {
                Ok(response) => self.handle_response(nsid, target, response).await,
                Err(e) => Err(StoreError::Http(e)),
            };

            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_expired_token() && !refreshed => {
                    refreshed = true;
                    if !self.try_refresh().await {
                        return Err(e);
                    }
                }
                Err(e)
                    if e.is_transient()
                        && !matches!(e, StoreError::RateLimited { .. })
                        && attempt < self.max_retries =>
                {
                    let backoff_ms = 500u64 << attempt;
                    warn!(
                        endpoint = nsid,
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "transient store error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        nsid: &'static str,
        target: Option<&RecordRef>,
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        let status = response.status();
        let not_found = || {
            target.map(|handle| StoreError::NotFound {
                collection: handle.collection().to_string(),
                rkey: handle.rkey().to_string(),
            })
        };

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(StoreError::RateLimited {
                endpoint: Some(nsid.to_string()),
                retry_after_secs,
            });
        }

        if status == StatusCode::NOT_FOUND
            && let Some(err) = not_found()
        {
            return Err(err);
        }

        if !status.is_success() {
            let text = response.text().await.map_err(|e| {
                StoreError::InvalidResponse(format!(
                    "{} failed ({}): failed to read response: {}",
                    nsid, status, e
                ))
            })?;

            if let Ok(xrpc_error) = serde_json::from_str::<XrpcError>(&text) {
                if xrpc_error.error == "RecordNotFound"
                    && let Some(err) = not_found()
                {
                    return Err(err);
                }
                return Err(StoreError::Xrpc {
                    error: xrpc_error.error,
                    message: xrpc_error.message,
                });
            }

            return Err(StoreError::InvalidResponse(format!(
                "{} failed ({}): {}",
                nsid, status, text
            )));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Build the signed-in user, reading the profile record when present.
    async fn load_user(&self, session: &Session) -> CurrentUser {
        let profile = self
            .call::<GetRecordResponse, _>("com.atproto.repo.getRecord", None, |http, url| {
                http.get(url).query(&[
                    ("repo", session.did.as_str()),
                    ("collection", PROFILE_COLLECTION),
                    ("rkey", PROFILE_KEY),
                ])
            })
            .await
            .map(|r| r.value);

        let profile = match profile {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(did = %session.did, error = %e, "no profile record, falling back to handle");
                None
            }
        };

        let display_name = profile
            .as_ref()
            .and_then(|p| p.get("displayName"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(String::from);

        let photo_url = profile
            .as_ref()
            .and_then(|p| p.pointer("/avatar/ref/$link"))
            .and_then(Value::as_str)
            .map(|cid| {
                format!(
                    "{}/xrpc/com.atproto.sync.getBlob?did={}&cid={}",
                    self.pds_url, session.did, cid
                )
            });

        CurrentUser {
            did: session.did.clone(),
            handle: session.handle.clone(),
            display_name,
            photo_url,
        }
    }

    fn clear_user(&self) {
        self.user_tx.send_replace(None);
    }
}

/// Copy of `record` carrying the collection as `$type`.
fn typed_record(collection: &str, record: &Value) -> Value {
    let mut record = record.clone();
    if let Value::Object(ref mut map) = record {
        map.insert("$type".to_string(), Value::String(collection.to_string()));
    }
    record
}

#[async_trait]
impl RecordStore for XrpcStore {
    async fn list(&self, collection: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let did = self.require_did().await?;
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page: ListRecordsResponse = self
                .call("com.atproto.repo.listRecords", None, |http, url| {
                    let mut query = vec![
                        ("repo", did.clone()),
                        ("collection", collection.to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                    ];
                    if let Some(cursor) = &cursor {
                        query.push(("cursor", cursor.clone()));
                    }
                    http.get(url).query(&query)
                })
                .await?;

            for item in page.records {
                records.push(StoredRecord {
                    handle: RecordRef::parse(&item.uri)?,
                    cid: Some(item.cid),
                    value: item.value,
                });
            }

            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        debug!(collection, count = records.len(), "listed records");
        Ok(records)
    }

    async fn create(&self, collection: &str, record: &Value) -> Result<StoredRecord, StoreError> {
        #[derive(Serialize)]
        struct CreateRequest<'a> {
            repo: &'a str,
            collection: &'a str,
            rkey: &'a str,
            record: &'a Value,
        }

        let did = self.require_did().await?;
        let record = typed_record(collection, record);
        // Fixed key so a retried create conflicts instead of duplicating.
        let rkey = Tid::now();

        let response: WriteRecordResponse = self
            .call("com.atproto.repo.createRecord", None, |http, url| {
                http.post(url).json(&CreateRequest {
                    repo: &did,
                    collection,
                    rkey: rkey.as_str(),
                    record: &record,
                })
            })
            .await?;

        let handle = RecordRef::parse(&response.uri)?;
        debug!(handle = %handle, cid = %response.cid, "created record");

        Ok(StoredRecord {
            handle,
            cid: Some(response.cid),
            value: record,
        })
    }

    async fn replace(
        &self,
        handle: &RecordRef,
        record: &Value,
    ) -> Result<StoredRecord, StoreError> {
        #[derive(Serialize)]
        struct PutRequest<'a> {
            repo: &'a str,
            collection: &'a str,
            rkey: &'a str,
            record: &'a Value,
        }

        let record = typed_record(handle.collection(), record);

        let response: WriteRecordResponse = self
            .call("com.atproto.repo.putRecord", Some(handle), |http, url| {
                http.post(url).json(&PutRequest {
                    repo: handle.repo(),
                    collection: handle.collection(),
                    rkey: handle.rkey(),
                    record: &record,
                })
            })
            .await?;

        debug!(handle = %handle, cid = %response.cid, "replaced record");

        Ok(StoredRecord {
            handle: handle.clone(),
            cid: Some(response.cid),
            value: record,
        })
    }

    async fn delete(&self, handle: &RecordRef) -> Result<(), StoreError> {
        #[derive(Serialize)]
        struct DeleteRequest<'a> {
            repo: &'a str,
            collection: &'a str,
            rkey: &'a str,
        }

        let _: IgnoredAny = self
            .call("com.atproto.repo.deleteRecord", Some(handle), |http, url| {
                http.post(url).json(&DeleteRequest {
                    repo: handle.repo(),
                    collection: handle.collection(),
                    rkey: handle.rkey(),
                })
            })
            .await?;

        debug!(handle = %handle, "deleted record");
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for XrpcStore {
    async fn sign_in(&self, identifier: &str, password: &str) -> Result<CurrentUser, StoreError> {
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            identifier: &'a str,
            password: &'a str,
        }

        let response = self
            .http
            .post(self.endpoint("com.atproto.server.createSession"))
            .json(&LoginRequest {
                identifier,
                password,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.map_err(|e| {
                StoreError::Auth(format!(
                    "login failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;
            return Err(StoreError::Auth(format!(
                "login failed ({}): {}",
                status, text
            )));
        }

        let session: Session = response.json().await?;
        debug!(did = %session.did, handle = %session.handle, "authenticated with PDS");
        *self.session.write().await = Some(session.clone());

        let user = self.load_user(&session).await;
        info!(did = %user.did, handle = %user.handle, "signed in");
        self.user_tx.send_replace(Some(user.clone()));

        Ok(user)
    }

    async fn sign_out(&self) -> Result<(), StoreError> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        self.clear_user();

        let response = self
            .http
            .post(self.endpoint("com.atproto.server.deleteSession"))
            .bearer_auth(&session.refresh_jwt)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(did = %session.did, %status, "server did not end the session");
            return Err(StoreError::Auth(format!("sign-out failed ({})", status)));
        }

        info!(did = %session.did, "signed out");
        Ok(())
    }

    async fn delete_account(&self, password: &str, token: &str) -> Result<(), StoreError> {
        #[derive(Serialize)]
        struct DeleteAccountRequest<'a> {
            did: &'a str,
            password: &'a str,
            token: &'a str,
        }

        let did = self.require_did().await?;

        let _: IgnoredAny = self
            .call("com.atproto.server.deleteAccount", None, |http, url| {
                http.post(url).json(&DeleteAccountRequest {
                    did: &did,
                    password,
                    token,
                })
            })
            .await?;

        *self.session.write().await = None;
        self.clear_user();
        info!(did = %did, "account deleted");
        Ok(())
    }

    fn current_user(&self) -> watch::Receiver<Option<CurrentUser>> {
        self.user_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "did": "did:plc:testuser123",
                "handle": "test.example.com",
                "accessJwt": "test-access-token",
                "refreshJwt": "test-refresh-token"
            })))
            .mount(server)
            .await;
    }

    async fn signed_in(server: &MockServer) -> XrpcStore {
        mount_login(server).await;
        let store = XrpcStore::new(server.uri()).with_max_retries(1);
        store.sign_in("test.example.com", "password").await.unwrap();
        store
    }

    fn idea_handle(rkey: &str) -> RecordRef {
        RecordRef::new("did:plc:testuser123", "app.ideaboard.idea", rkey)
    }

    #[test]
    fn test_store_pds_url() {
        let store = XrpcStore::new("https://my-pds.example.com/");
        assert_eq!(store.pds_url(), "https://my-pds.example.com");
    }

    #[tokio::test]
    async fn test_did_without_session() {
        let store = XrpcStore::new("https://example.com");
        assert_eq!(store.did().await, None);
        assert!(store.current_user().borrow().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_reads_profile() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.getRecord"))
            .and(query_param("collection", PROFILE_COLLECTION))
            .and(header("Authorization", "Bearer test-access-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:testuser123/app.bsky.actor.profile/self",
                "value": {
                    "displayName": "Test User",
                    "avatar": { "$type": "blob", "ref": { "$link": "bafyavatar" } }
                }
            })))
            .mount(&server)
            .await;

        let store = XrpcStore::new(server.uri());
        let user = store.sign_in("test.example.com", "password").await.unwrap();

        assert_eq!(user.did, "did:plc:testuser123");
        assert_eq!(user.display_name.as_deref(), Some("Test User"));
        assert_eq!(
            user.photo_url,
            Some(format!(
                "{}/xrpc/com.atproto.sync.getBlob?did=did:plc:testuser123&cid=bafyavatar",
                server.uri()
            ))
        );
        assert_eq!(store.current_user().borrow().as_ref(), Some(&user));
    }

    #[tokio::test]
    async fn test_sign_in_without_profile_falls_back() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        let user = store.current_user().borrow().clone().unwrap();
        assert_eq!(user.handle, "test.example.com");
        assert_eq!(user.display_name, None);
        assert_eq!(user.photo_url, None);
    }

    #[tokio::test]
    async fn test_sign_in_failure() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "AuthenticationRequired",
                "message": "Invalid credentials"
            })))
            .mount(&server)
            .await;

        let store = XrpcStore::new(server.uri());
        let err = store.sign_in("test.example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, StoreError::Auth(_)));
        assert!(store.current_user().borrow().is_none());
    }

    #[tokio::test]
    async fn test_list_requires_session() {
        let store = XrpcStore::new("https://example.com");
        let err = store.list("app.ideaboard.idea").await.unwrap_err();
        assert!(matches!(err, StoreError::Auth(_)));
    }

    #[tokio::test]
    async fn test_list_follows_cursor() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.listRecords"))
            .and(query_param("cursor", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "records": [{
                    "uri": "at://did:plc:testuser123/app.ideaboard.idea/bbb",
                    "cid": "cid-b",
                    "value": { "id": "idea-b" }
                }]
            })))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.listRecords"))
            .and(query_param("collection", "app.ideaboard.idea"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "records": [{
                    "uri": "at://did:plc:testuser123/app.ideaboard.idea/aaa",
                    "cid": "cid-a",
                    "value": { "id": "idea-a" }
                }],
                "cursor": "page2"
            })))
            .mount(&server)
            .await;

        let records = store.list("app.ideaboard.idea").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].handle, idea_handle("aaa"));
        assert_eq!(records[0].idea_id(), Some("idea-a"));
        assert_eq!(records[1].handle, idea_handle("bbb"));
        assert_eq!(records[1].cid.as_deref(), Some("cid-b"));
    }

    #[tokio::test]
    async fn test_create_stamps_type() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({
                "repo": "did:plc:testuser123",
                "collection": "app.ideaboard.idea",
                "record": { "$type": "app.ideaboard.idea", "id": "idea-1" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:testuser123/app.ideaboard.idea/3new",
                "cid": "cid-new"
            })))
            .mount(&server)
            .await;

        let stored = store
            .create("app.ideaboard.idea", &json!({ "id": "idea-1" }))
            .await
            .unwrap();

        assert_eq!(stored.handle, idea_handle("3new"));
        assert_eq!(stored.cid.as_deref(), Some("cid-new"));
        assert_eq!(stored.value["$type"], "app.ideaboard.idea");
    }

    #[tokio::test]
    async fn test_replace_targets_handle() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.putRecord"))
            .and(body_partial_json(json!({
                "rkey": "3abc",
                "record": { "votes": 4 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:testuser123/app.ideaboard.idea/3abc",
                "cid": "cid-2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let stored = store
            .replace(&idea_handle("3abc"), &json!({ "id": "idea-1", "votes": 4 }))
            .await
            .unwrap();
        assert_eq!(stored.cid.as_deref(), Some("cid-2"));
    }

    #[tokio::test]
    async fn test_delete_not_found() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = store.delete(&idea_handle("missing")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { rkey, .. } if rkey == "missing"));
    }

    #[tokio::test]
    async fn test_delete_accepts_empty_body() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        store.delete(&idea_handle("3abc")).await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .respond_with(ResponseTemplate::new(502).set_body_json(json!({
                "error": "UpstreamFailure",
                "message": "try again"
            })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        store.delete(&idea_handle("3abc")).await.unwrap();
    }

    #[tokio::test]
    async fn test_retried_create_reuses_rkey() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": "InternalServerError",
                "message": "committed but failed to respond"
            })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:testuser123/app.ideaboard.idea/3new",
                "cid": "cid-new"
            })))
            .mount(&server)
            .await;

        store
            .create("app.ideaboard.idea", &json!({ "id": "idea-1" }))
            .await
            .unwrap();

        let rkeys: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/xrpc/com.atproto.repo.createRecord")
            .map(|r| {
                let body: Value = serde_json::from_slice(&r.body).unwrap();
                body["rkey"].as_str().unwrap().to_string()
            })
            .collect();

        assert_eq!(rkeys.len(), 2);
        assert_eq!(rkeys[0], rkeys[1]);
        assert_eq!(rkeys[0].len(), 13);
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.listRecords"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let err = store.list("app.ideaboard.idea").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::RateLimited {
                retry_after_secs: Some(7),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.refreshSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "did": "did:plc:testuser123",
                "handle": "test.example.com",
                "accessJwt": "fresh-access-token",
                "refreshJwt": "fresh-refresh-token"
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .and(header("Authorization", "Bearer fresh-access-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "ExpiredToken",
                "message": "Token has expired"
            })))
            .mount(&server)
            .await;

        store.delete(&idea_handle("3abc")).await.unwrap();
    }

    #[tokio::test]
    async fn test_sign_out_clears_session() {
        let server = MockServer::start().await;
        let store = signed_in(&server).await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.deleteSession"))
            .and(header("Authorization", "Bearer test-refresh-token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        store.sign_out().await.unwrap();
        assert_eq!(store.did().await, None);
        assert!(store.current_user().borrow().is_none());

        // Second sign-out is a no-op.
        store.sign_out().await.unwrap();
    }
}
