#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use confsync_jobs::JobRegistry;
use confsync_pipeline::{
    BackupStore, ClientFactory, ConnectionProfile, Pipeline, RemoteClient, RemoteError, WorkDirs,
};
use rusqlite::Connection;
use serde_json::{json, Value};

/// In-memory stand-in for a remote instance's API.
///
/// Collections are keyed by their list endpoint. GETs with a `page` query
/// are paginated the same way the real API does it.
#[derive(Default)]
pub struct FakeRemote {
    pub name: String,
    collections: Mutex<BTreeMap<String, Vec<Value>>>,
    next_id: AtomicU64,
    pub reject_auth: Mutex<bool>,
    /// Writes of records with these names fail with a 400.
    pub failing: Mutex<HashSet<String>>,
    pub writes: AtomicUsize,
    pub pages: AtomicUsize,
    on_page: Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>,
}

impl FakeRemote {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            next_id: AtomicU64::new(1000),
            ..Default::default()
        })
    }

    pub fn seed(&self, endpoint: &str, records: Vec<Value>) {
        self.collections
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), records);
    }

    pub fn records(&self, endpoint: &str) -> Vec<Value> {
        self.collections
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_on(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// Run `hook` with the running page count after every paginated GET.
    pub fn on_page(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_page.lock().unwrap() = Some(Box::new(hook));
    }

    fn check_write(&self, payload: &Value) -> Result<(), RemoteError> {
        let name = payload
            .get("name")
            .or_else(|| payload.get("username"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if self.failing.lock().unwrap().contains(name) {
            return Err(RemoteError::Api {
                status: 400,
                message: format!("rejected {name}"),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Split `/api/x/12/` into (`/api/x/`, `12`).
    fn split_item(endpoint: &str) -> Option<(String, String)> {
        let trimmed = endpoint.trim_end_matches('/');
        let (base, id) = trimmed.rsplit_once('/')?;
        Some((format!("{base}/"), id.to_string()))
    }
}

fn id_matches(record: &Value, id: &str) -> bool {
    match record.get("id") {
        Some(Value::Number(n)) => n.to_string() == id,
        Some(Value::String(s)) => s == id,
        _ => false,
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self) -> Result<(), RemoteError> {
        if *self.reject_auth.lock().unwrap() {
            return Err(RemoteError::Auth("bad credentials".into()));
        }
        Ok(())
    }

    async fn get(&self, endpoint: &str) -> Result<Value, RemoteError> {
        let (path, query) = endpoint.split_once('?').unwrap_or((endpoint, ""));
        let params: HashMap<&str, usize> = query
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .filter_map(|(k, v)| Some((k, v.parse().ok()?)))
            .collect();
        let records = self.records(path);

        let (Some(&page), Some(&size)) = (params.get("page"), params.get("page_size")) else {
            return Ok(Value::Array(records));
        };
        let start = (page - 1) * size;
        let slice: Vec<Value> = records.iter().skip(start).take(size).cloned().collect();
        let more = start + size < records.len();

        let count = self.pages.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.on_page.lock().unwrap().as_ref() {
            hook(count);
        }
        Ok(json!({
            "count": records.len(),
            "results": slice,
            "next": if more { json!(format!("{path}?page={}", page + 1)) } else { Value::Null },
        }))
    }

    async fn post(&self, endpoint: &str, payload: &Value) -> Result<Value, RemoteError> {
        self.check_write(payload)?;
        let mut record = payload.clone();
        record["id"] = json!(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.collections
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn put(&self, endpoint: &str, payload: &Value) -> Result<Value, RemoteError> {
        self.patch(endpoint, payload).await
    }

    async fn patch(&self, endpoint: &str, payload: &Value) -> Result<Value, RemoteError> {
        self.check_write(payload)?;
        let (base, id) = Self::split_item(endpoint).ok_or_else(|| RemoteError::Api {
            status: 404,
            message: endpoint.to_string(),
        })?;
        let mut collections = self.collections.lock().unwrap();
        let record = collections
            .get_mut(&base)
            .and_then(|c| c.iter_mut().find(|r| id_matches(r, &id)))
            .ok_or_else(|| RemoteError::Api {
                status: 404,
                message: endpoint.to_string(),
            })?;
        if let (Value::Object(target), Value::Object(fields)) = (&mut *record, payload) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        Ok(record.clone())
    }

    async fn delete(&self, _endpoint: &str) -> Result<Value, RemoteError> {
        Ok(Value::Null)
    }

    async fn download(&self, endpoint: &str) -> Result<Vec<u8>, RemoteError> {
        if endpoint.contains("missing") {
            return Err(RemoteError::Api {
                status: 404,
                message: endpoint.to_string(),
            });
        }
        Ok(endpoint.as_bytes().to_vec())
    }
}

/// Hands out the fake registered under a profile's id.
#[derive(Default)]
pub struct FakeFactory {
    remotes: Mutex<HashMap<String, Arc<FakeRemote>>>,
}

impl FakeFactory {
    pub fn register(&self, profile: &ConnectionProfile, remote: Arc<FakeRemote>) {
        self.remotes
            .lock()
            .unwrap()
            .insert(profile.id.clone(), remote);
    }
}

impl ClientFactory for FakeFactory {
    fn client_for(&self, profile: &ConnectionProfile) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        self.remotes
            .lock()
            .unwrap()
            .get(&profile.id)
            .cloned()
            .map(|r| r as Arc<dyn RemoteClient>)
            .ok_or_else(|| RemoteError::Api {
                status: 502,
                message: format!("no fake for {}", profile.id),
            })
    }
}

pub fn profile(id: &str) -> ConnectionProfile {
    ConnectionProfile {
        id: id.to_string(),
        name: id.to_string(),
        base_url: format!("http://{id}.local"),
        username: "admin".to_string(),
        password: "secret".to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub struct Harness {
    pub registry: Arc<JobRegistry>,
    pub factory: Arc<FakeFactory>,
    pub work_dirs: Arc<WorkDirs>,
    pub backups: Arc<BackupStore>,
    pub pipeline: Arc<Pipeline>,
    pub tmp: tempfile::TempDir,
}

impl Harness {
    pub fn new(page_size: u32) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(Connection::open_in_memory().unwrap()).unwrap());
        let factory = Arc::new(FakeFactory::default());
        let work_dirs = Arc::new(WorkDirs::new(tmp.path().join("work")).unwrap());
        let backups = Arc::new(
            BackupStore::new(Connection::open_in_memory().unwrap(), tmp.path().join("backups")).unwrap(),
        );
        let pipeline = Arc::new(Pipeline::new(
            factory.clone(),
            Arc::clone(&work_dirs),
            Arc::clone(&backups),
            page_size,
        ));
        Self {
            registry,
            factory,
            work_dirs,
            backups,
            pipeline,
            tmp,
        }
    }

    pub fn remote(&self, id: &str) -> (ConnectionProfile, Arc<FakeRemote>) {
        let profile = profile(id);
        let remote = FakeRemote::new(id);
        self.factory.register(&profile, Arc::clone(&remote));
        (profile, remote)
    }
}
