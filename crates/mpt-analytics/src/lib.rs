//! Read-side queries over stored products: history, metrics, recent changes,
//! top movers and the dashboard listing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use mpt_core::{normalize_product_id, round_cents, PriceHistoryEntry, Product};
use mpt_storage::{DocumentStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "mpt-analytics";

pub const DEFAULT_LISTING_LIMIT: usize = 300;
pub const DEFAULT_MOVING_AVERAGE_WINDOW: usize = 7;
/// Recent changes scanned when ranking movers.
pub const MOVERS_SCAN_LIMIT: usize = 1000;

/// Start of a trailing window of `hours`. `None` when the window reaches
/// back before the Unix epoch or past what `DateTime` can represent.
fn window_start(hours: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    TimeDelta::try_hours(hours.max(0))
        .and_then(|span| now.checked_sub_signed(span))
        .filter(|start| *start >= DateTime::UNIX_EPOCH)
}

fn cutoff(window_hours: Option<i64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    window_hours
        .filter(|h| *h > 0)
        .and_then(|h| window_start(h, now))
}

/// Price history of a product (by name or id), ascending by time.
pub async fn get_price_history(
    store: &dyn DocumentStore,
    product: &str,
    window_hours: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Vec<PriceHistoryEntry>, StoreError> {
    let id = normalize_product_id(product);
    let mut points = store.price_history(&id, cutoff(window_hours, now)).await?;
    points.sort_by_key(|p| p.at);
    debug!(%id, points = points.len(), "loaded price history");
    Ok(points)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceMetrics {
    pub first_price: f64,
    pub last_price: f64,
    pub delta_abs: f64,
    pub delta_pct: f64,
    /// Mean of the last `window` prices.
    pub moving_avg: f64,
    /// Least-squares slope of price against sample index.
    pub slope: Option<f64>,
}

pub fn compute_metrics(history: &[PriceHistoryEntry], window: usize) -> Option<PriceMetrics> {
    let first_price = history.first()?.price;
    let last_price = history.last()?.price;
    let delta_abs = round_cents(last_price - first_price);
    let delta_pct = if first_price == 0.0 {
        0.0
    } else {
        round_cents(delta_abs / first_price * 100.0)
    };

    let window = window.max(1).min(history.len());
    let tail = &history[history.len() - window..];
    let moving_avg = round_cents(tail.iter().map(|p| p.price).sum::<f64>() / window as f64);

    Some(PriceMetrics {
        first_price,
        last_price,
        delta_abs,
        delta_pct,
        moving_avg,
        slope: linear_slope(history),
    })
}

fn linear_slope(history: &[PriceHistoryEntry]) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let n = history.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = history.iter().map(|p| p.price).sum::<f64>() / n;
    let (num, den) = history
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, p)| {
            let dx = i as f64 - mean_x;
            (num + dx * (p.price - mean_y), den + dx * dx)
        });
    Some(num / den)
}

/// Products whose price changed in the last `window_hours`, oldest change first.
pub async fn get_recent_changes(
    store: &dyn DocumentStore,
    window_hours: i64,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<Product>, StoreError> {
    store
        .changed_since(
            window_start(window_hours, now).unwrap_or(DateTime::UNIX_EPOCH),
            limit,
        )
        .await
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoverMode {
    #[default]
    Abs,
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mover mode {0:?} (expected abs, up or down)")]
pub struct UnknownMoverMode(pub String);

impl FromStr for MoverMode {
    type Err = UnknownMoverMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abs" => Ok(Self::Abs),
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            _ => Err(UnknownMoverMode(s.to_string())),
        }
    }
}

impl fmt::Display for MoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Abs => "abs",
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mover {
    pub product_id: String,
    pub name: String,
    pub current_price: f64,
    pub last_price: f64,
    pub delta: f64,
    pub price_changed_at: Option<DateTime<Utc>>,
}

impl From<Product> for Mover {
    fn from(p: Product) -> Self {
        Self {
            delta: p.delta(),
            product_id: p.id,
            name: p.name,
            current_price: p.current_price,
            last_price: p.last_price,
            price_changed_at: p.price_changed_at,
        }
    }
}

/// Stable ranking of products by their last price move.
pub fn rank_movers(products: Vec<Product>, mode: MoverMode, top: usize) -> Vec<Mover> {
    let mut movers = products.into_iter().map(Mover::from).collect::<Vec<_>>();
    match mode {
        MoverMode::Abs => movers.sort_by(|a, b| b.delta.abs().total_cmp(&a.delta.abs())),
        MoverMode::Up => movers.sort_by(|a, b| b.delta.total_cmp(&a.delta)),
        MoverMode::Down => movers.sort_by(|a, b| a.delta.total_cmp(&b.delta)),
    }
    movers.truncate(top);
    movers
}

pub async fn get_top_movers(
    store: &dyn DocumentStore,
    window_hours: i64,
    top: usize,
    mode: MoverMode,
    now: DateTime<Utc>,
) -> Result<Vec<Mover>, StoreError> {
    let recent = get_recent_changes(store, window_hours, MOVERS_SCAN_LIMIT, now).await?;
    Ok(rank_movers(recent, mode, top))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductFilter {
    /// Only products seen in the last N hours; `None` or 0 lists everything.
    pub last_seen_hours: Option<i64>,
    /// Case-insensitive substring of the name.
    pub search: Option<String>,
    pub only_changed: bool,
    pub limit: usize,
}

impl Default for ProductFilter {
    fn default() -> Self {
        Self {
            last_seen_hours: None,
            search: None,
            only_changed: false,
            limit: DEFAULT_LISTING_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub current_price: f64,
    pub last_price: f64,
    pub delta: f64,
    /// Relative to `last_price`; `None` when that is not positive.
    pub delta_pct: Option<f64>,
    pub change_count: i64,
    pub last_seen_at: DateTime<Utc>,
    pub price_changed_at: Option<DateTime<Utc>>,
}

impl From<Product> for ProductView {
    fn from(p: Product) -> Self {
        let delta = p.delta();
        let delta_pct = (p.last_price > 0.0).then(|| round_cents(delta / p.last_price * 100.0));
        Self {
            id: p.id,
            name: p.name,
            description: p.description,
            current_price: p.current_price,
            last_price: p.last_price,
            delta,
            delta_pct,
            change_count: p.change_count,
            last_seen_at: p.last_seen_at,
            price_changed_at: p.price_changed_at,
        }
    }
}

pub async fn list_products(
    store: &dyn DocumentStore,
    filter: &ProductFilter,
    now: DateTime<Utc>,
) -> Result<Vec<ProductView>, StoreError> {
    let products = store
        .list_products(cutoff(filter.last_seen_hours, now), filter.limit)
        .await?;
    let needle = filter
        .search
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());

    Ok(products
        .into_iter()
        .filter(|p| {
            needle
                .as_deref()
                .map_or(true, |n| p.name.to_lowercase().contains(n))
        })
        .map(ProductView::from)
        .filter(|v| !filter.only_changed || v.delta != 0.0)
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kpi {
    pub name: String,
    pub delta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub total: usize,
    pub changed: usize,
    pub biggest_rise: Option<Kpi>,
    pub biggest_drop: Option<Kpi>,
}

/// KPI cards for a listing. Rise and drop only count strictly positive and negative deltas.
pub fn summarize(rows: &[ProductView]) -> DashboardSummary {
    let kpi = |v: &ProductView| Kpi {
        name: v.name.clone(),
        delta: v.delta,
    };
    let biggest_rise = rows
        .iter()
        .filter(|v| v.delta > 0.0)
        .fold(None::<&ProductView>, |best, v| match best {
            Some(b) if b.delta >= v.delta => Some(b),
            _ => Some(v),
        })
        .map(kpi);
    let biggest_drop = rows
        .iter()
        .filter(|v| v.delta < 0.0)
        .fold(None::<&ProductView>, |best, v| match best {
            Some(b) if b.delta <= v.delta => Some(b),
            _ => Some(v),
        })
        .map(kpi);

    DashboardSummary {
        total: rows.len(),
        changed: rows.iter().filter(|v| v.delta != 0.0).count(),
        biggest_rise,
        biggest_drop,
    }
}
