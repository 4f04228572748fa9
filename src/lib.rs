#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]
#![allow(clippy::needless_range_loop)]
#![warn(clippy::future_not_send)]
#![warn(clippy::unused_async)]

pub mod app_handlers;
pub mod chair_handlers;
pub mod dl;
pub mod matcher;
pub mod middlewares;
pub mod models;
pub mod owner_handlers;
pub mod payment_gateway;
pub mod repo;
pub mod speed;

use std::sync::{atomic::AtomicI64, Arc};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use models::SymbolHasherBuilder;
use repo::Repository;
use speed::SpeedStatistics;

pub type HashMap<K, V> = hashbrown::HashMap<K, V>;
pub type HashSet<K> = hashbrown::HashSet<K>;

/// Scratch maps used inside [`repo::deferred`] summarize passes, where keys
/// are ULIDs/short-lived ids and DoS resistance doesn't matter.
pub type FxHashMap<K, V> = std::collections::HashMap<K, V, fxhash::FxBuildHasher>;
pub type FxHashSet<K> = std::collections::HashSet<K, fxhash::FxBuildHasher>;

pub type ConcurrentHashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type ConcurrentHashSet<K> = dashmap::DashSet<K, ahash::RandomState>;

pub type ConcurrentSymbolMap<K, V> = dashmap::DashMap<K, V, SymbolHasherBuilder>;
pub type ConcurrentSymbolSet<K> = dashmap::DashSet<K, SymbolHasherBuilder>;

/// Lock-free timestamp cell, microsecond resolution. Used for per-entity
/// `updated_at` fields that are bumped from request handlers without taking
/// a write lock on the whole entity.
#[derive(Debug)]
pub struct AtomicDateTime(AtomicI64);
impl AtomicDateTime {
    pub fn new(d: DateTime<Utc>) -> Self {
        let s = Self(AtomicI64::new(0));
        s.store(d);
        s
    }
    pub fn load(&self) -> DateTime<Utc> {
        let raw = self.0.load(std::sync::atomic::Ordering::Relaxed);
        DateTime::from_timestamp_micros(raw).unwrap()
    }
    pub fn store(&self, d: DateTime<Utc>) {
        let d = d.timestamp_micros();
        self.0.store(d, std::sync::atomic::Ordering::Relaxed);
    }
}

pub type AppState = Arc<AppStateInner>;

#[derive(Debug)]
pub struct AppStateInner {
    /// Only touched at `/api/initialize` (warm-load) and by the handful of
    /// residual owner-facing queries out of scope for the core; the hot
    /// path never opens a connection.
    pub pool: sqlx::MySqlPool,
    pub repo: Arc<Repository>,

    #[cfg(feature = "speed")]
    pub speed: SpeedStatistics,

    pub client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON decode: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("failed to initialize: stdout={stdout} stderr={stderr}")]
    Initialize { stdout: String, stderr: String },
    #[error("{0}")]
    PaymentGateway(#[from] crate::payment_gateway::PaymentGatewayError),
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::BadRequest(m) => (StatusCode::BAD_REQUEST, (*m).to_owned()),
            Error::Unauthorized(m) => (StatusCode::UNAUTHORIZED, (*m).to_owned()),
            Error::NotFound(m) => (StatusCode::NOT_FOUND, (*m).to_owned()),
            Error::Conflict(m) => (StatusCode::CONFLICT, (*m).to_owned()),
            Error::PaymentGateway(_) => {
                tracing::warn!("payment gateway failed: {self}");
                (StatusCode::BAD_GATEWAY, "errored_upstream".to_owned())
            }
            _ => {
                tracing::error!("internal error: {self}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_owned())
            }
        };
        (status, axum::Json(serde_json::json!({ "message": message }))).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy, serde::Serialize, serde::Deserialize)]
pub struct Coordinate {
    pub latitude: i32,
    pub longitude: i32,
}
impl Coordinate {
    pub fn distance(&self, other: Coordinate) -> i32 {
        (self.latitude.abs_diff(other.latitude) + self.longitude.abs_diff(other.longitude)) as i32
    }
}

pub fn secure_random_str(b: usize) -> String {
    use rand::RngCore as _;
    let mut buf = vec![0; b];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut buf);
    hex::encode(&buf)
}

const INITIAL_FARE: i32 = 500;
const FARE_PER_DISTANCE: i32 = 100;

pub fn calculate_fare(pickup: Coordinate, dest: Coordinate) -> i32 {
    let metered_fare = FARE_PER_DISTANCE * pickup.distance(dest);
    INITIAL_FARE + metered_fare
}

pub fn calculate_discounted_fare(pickup: Coordinate, dest: Coordinate, discount: i32) -> i32 {
    let metered_fare = FARE_PER_DISTANCE * pickup.distance(dest);
    INITIAL_FARE + (metered_fare - discount).max(0)
}

#[macro_export]
macro_rules! conf_env {
    (static $name:ident: $ty:ty = {from: $env:expr, default: $def:expr,}) => {
        static $name: std::sync::LazyLock<$ty> = std::sync::LazyLock::new(|| {
            let v = std::env::var($env)
                .unwrap_or_else(|_| $def.to_owned())
                .parse()
                .unwrap_or_else(|_| panic!(concat!("invalid ", $env)));
            tracing::info!("{} = {v}", $env);
            v
        });
    };
}
