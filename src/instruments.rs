// ─────────────────────────────────────────────────────────────────────────────
// instruments.rs — per-symbol trading rules and the three-tier spec cache
//
// Tier 1: in-memory map, entries valid for one hour after fetch.
// Tier 2: Postgres (contract_specs / spot_specs), refreshed on every fetch.
// Tier 3: the exchange's public endpoint, which returns every symbol; the
//         cache filters down to the requested row and persists it.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::Row;

use crate::error::{EngineError, Result};
use crate::exchange::{field_f64, BitgetClient};

pub const PRODUCT_TYPE_USDT_FUTURES: &str = "USDT-FUTURES";

const CONTRACTS_PATH: &str = "/api/v2/mix/market/contracts";
const SPOT_SYMBOLS_PATH: &str = "/api/v2/spot/public/symbols";

const SPEC_TTL_SECS: i64 = 3600;
const LIST_LIMIT: usize = 50;

/// Small popularity list surfaced by the symbol picker.
pub const HOT_SYMBOLS: [&str; 8] = [
    "BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "BNBUSDT", "ADAUSDT", "AVAXUSDT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueKind {
    Derivatives,
    Spot,
}

impl VenueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueKind::Derivatives => "derivatives",
            VenueKind::Spot => "spot",
        }
    }

    /// Code stored alongside persisted orders so recovery can scope by venue.
    pub fn code(&self) -> &'static str {
        match self {
            VenueKind::Derivatives => PRODUCT_TYPE_USDT_FUTURES,
            VenueKind::Spot => "SPOT",
        }
    }
}

/// Contract/spot trading rules for one symbol. Immutable after fetch; the
/// engines take a copy at strategy start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub symbol: String,
    pub venue: VenueKind,
    pub base_coin: String,
    pub quote_coin: String,
    pub price_place: u32,
    pub volume_place: u32,
    pub min_trade_num: f64,
    pub size_multiplier: f64,
    pub maker_fee_rate: f64,
    pub taker_fee_rate: f64,
    pub status: String,
}

impl InstrumentSpec {
    pub fn tick_size(&self) -> f64 {
        10f64.powi(-(self.price_place as i32))
    }

    pub fn size_step(&self) -> f64 {
        10f64.powi(-(self.volume_place as i32))
    }

    pub fn format_price(&self, price: f64) -> String {
        format_at_place(price, self.price_place)
    }

    pub fn format_size(&self, size: f64) -> String {
        format_at_place(size, self.volume_place)
    }

    /// Order size for a target notional at `price`, or None when the result
    /// falls below the instrument minimum or the size step.
    pub fn calc_size(&self, notional: f64, price: f64) -> Option<String> {
        if price <= 0.0 || notional <= 0.0 {
            return None;
        }
        let raw = notional / price;
        let rounded = round_at_place(raw, self.volume_place);
        if rounded < self.size_step() || rounded + 1e-12 < self.min_trade_num {
            return None;
        }
        Some(self.format_size(rounded))
    }

    fn is_tradeable(&self) -> bool {
        matches!(self.status.as_str(), "online" | "normal")
    }
}

pub fn round_at_place(value: f64, place: u32) -> f64 {
    let factor = 10f64.powi(place as i32);
    (value * factor).round() / factor
}

pub fn format_at_place(value: f64, place: u32) -> String {
    format!("{:.*}", place as usize, round_at_place(value, place))
}

// ─── Public-endpoint row parsing ─────────────────────────────────────────────

pub fn parse_contract_row(row: &Value) -> Option<InstrumentSpec> {
    Some(InstrumentSpec {
        symbol: row["symbol"].as_str()?.to_string(),
        venue: VenueKind::Derivatives,
        base_coin: row["baseCoin"].as_str().unwrap_or_default().to_string(),
        quote_coin: row["quoteCoin"].as_str().unwrap_or("USDT").to_string(),
        price_place: field_f64(row, "pricePlace")? as u32,
        volume_place: field_f64(row, "volumePlace")? as u32,
        min_trade_num: field_f64(row, "minTradeNum").unwrap_or(0.0),
        size_multiplier: field_f64(row, "sizeMultiplier").unwrap_or(1.0),
        maker_fee_rate: field_f64(row, "makerFeeRate").unwrap_or(0.0002),
        taker_fee_rate: field_f64(row, "takerFeeRate").unwrap_or(0.0006),
        status: row["symbolStatus"].as_str().unwrap_or("normal").to_string(),
    })
}

pub fn parse_spot_row(row: &Value) -> Option<InstrumentSpec> {
    Some(InstrumentSpec {
        symbol: row["symbol"].as_str()?.to_string(),
        venue: VenueKind::Spot,
        base_coin: row["baseCoin"].as_str().unwrap_or_default().to_string(),
        quote_coin: row["quoteCoin"].as_str().unwrap_or_default().to_string(),
        price_place: field_f64(row, "pricePrecision")? as u32,
        volume_place: field_f64(row, "quantityPrecision")? as u32,
        min_trade_num: field_f64(row, "minTradeAmount").unwrap_or(0.0),
        size_multiplier: 1.0,
        // The spot symbols endpoint omits fee rates for some listings.
        maker_fee_rate: field_f64(row, "makerFeeRate").unwrap_or(0.001),
        taker_fee_rate: field_f64(row, "takerFeeRate").unwrap_or(0.001),
        status: row["status"].as_str().unwrap_or("online").to_string(),
    })
}

fn parse_row(venue: VenueKind, row: &Value) -> Option<InstrumentSpec> {
    match venue {
        VenueKind::Derivatives => parse_contract_row(row),
        VenueKind::Spot => parse_spot_row(row),
    }
}

// ─── Cache ───────────────────────────────────────────────────────────────────

struct CachedSpec {
    spec: InstrumentSpec,
    fetched_at: DateTime<Utc>,
}

/// Process-wide spec cache. Constructed once in main and shared by handle.
pub struct SpecCache {
    client: Arc<BitgetClient>,
    pool: PgPool,
    memory: Mutex<HashMap<(String, VenueKind), CachedSpec>>,
}

impl SpecCache {
    pub fn new(client: Arc<BitgetClient>, pool: PgPool) -> Self {
        Self { client, pool, memory: Mutex::new(HashMap::new()) }
    }

    /// Walks the tiers in order. Every entry returned is at most one hour
    /// old, possibly freshly fetched.
    pub async fn get_spec(&self, symbol: &str, venue: VenueKind) -> Result<InstrumentSpec> {
        let key = (symbol.to_string(), venue);
        if let Some(spec) = self.fresh_from_memory(&key) {
            return Ok(spec);
        }
        match self.load_from_store(symbol, venue).await {
            Ok(Some((spec, fetched_at))) if is_fresh(fetched_at) => {
                self.remember(key, spec.clone(), fetched_at);
                return Ok(spec);
            }
            Ok(_) => {}
            Err(e) => log::warn!("[SPEC] store lookup failed for {}: {}", symbol, e),
        }
        self.refresh_spec(symbol, venue).await
    }

    /// Forces tier 3: fetches from the public endpoint and persists.
    pub async fn refresh_spec(&self, symbol: &str, venue: VenueKind) -> Result<InstrumentSpec> {
        let rows = self.fetch_all(venue).await?;
        let spec = rows
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| EngineError::SpecNotFound(format!("{} ({})", symbol, venue.as_str())))?;
        let now = Utc::now();
        if let Err(e) = self.store(&spec, now).await {
            log::warn!("[SPEC] failed to persist spec for {}: {}", symbol, e);
        }
        self.remember((symbol.to_string(), venue), spec.clone(), now);
        Ok(spec)
    }

    /// Up to 50 tradeable instruments, optionally filtered by an uppercase
    /// substring match on symbol or base coin. Spot listings are restricted
    /// to the USDT quote.
    pub async fn list_available(&self, venue: VenueKind, search: Option<&str>) -> Result<Vec<InstrumentSpec>> {
        let needle = search.map(|s| s.to_uppercase());
        let mut specs: Vec<InstrumentSpec> = self
            .fetch_all(venue)
            .await?
            .into_iter()
            .filter(|s| s.is_tradeable())
            .filter(|s| venue != VenueKind::Spot || s.quote_coin == "USDT")
            .filter(|s| match &needle {
                Some(n) => {
                    s.symbol.to_uppercase().contains(n) || s.base_coin.to_uppercase().contains(n)
                }
                None => true,
            })
            .collect();
        specs.truncate(LIST_LIMIT);
        Ok(specs)
    }

    /// Resolved specs for the popularity list, skipping symbols that fail.
    pub async fn hot_pairs(&self, venue: VenueKind) -> Vec<InstrumentSpec> {
        let mut out = Vec::new();
        for symbol in HOT_SYMBOLS {
            match self.get_spec(symbol, venue).await {
                Ok(spec) => out.push(spec),
                Err(e) => log::debug!("[SPEC] hot pair {} skipped: {}", symbol, e),
            }
        }
        out
    }

    fn fresh_from_memory(&self, key: &(String, VenueKind)) -> Option<InstrumentSpec> {
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        memory
            .get(key)
            .filter(|c| is_fresh(c.fetched_at))
            .map(|c| c.spec.clone())
    }

    fn remember(&self, key: (String, VenueKind), spec: InstrumentSpec, fetched_at: DateTime<Utc>) {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        memory.insert(key, CachedSpec { spec, fetched_at });
    }

    async fn fetch_all(&self, venue: VenueKind) -> Result<Vec<InstrumentSpec>> {
        let data = match venue {
            VenueKind::Derivatives => {
                self.client
                    .get_public(
                        CONTRACTS_PATH,
                        &[("productType", PRODUCT_TYPE_USDT_FUTURES.to_string())],
                    )
                    .await?
            }
            VenueKind::Spot => self.client.get_public(SPOT_SYMBOLS_PATH, &[]).await?,
        };
        let rows = data.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(|r| parse_row(venue, r)).collect())
    }

    async fn load_from_store(
        &self,
        symbol: &str,
        venue: VenueKind,
    ) -> Result<Option<(InstrumentSpec, DateTime<Utc>)>> {
        let row = match venue {
            VenueKind::Derivatives => {
                sqlx::query(
                    "SELECT raw_data, fetched_at FROM contract_specs \
                     WHERE symbol = $1 AND product_type = $2",
                )
                .bind(symbol)
                .bind(PRODUCT_TYPE_USDT_FUTURES)
                .fetch_optional(&self.pool)
                .await?
            }
            VenueKind::Spot => {
                sqlx::query("SELECT raw_data, fetched_at FROM spot_specs WHERE symbol = $1")
                    .bind(symbol)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        let Some(row) = row else { return Ok(None) };
        let raw: Value = row.try_get("raw_data")?;
        let fetched_at: DateTime<Utc> = row.try_get("fetched_at")?;
        let spec: InstrumentSpec = serde_json::from_value(raw)
            .map_err(|e| EngineError::Persistence(format!("bad stored spec: {}", e)))?;
        Ok(Some((spec, fetched_at)))
    }

    async fn store(&self, spec: &InstrumentSpec, fetched_at: DateTime<Utc>) -> Result<()> {
        let raw = serde_json::to_value(spec)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        match spec.venue {
            VenueKind::Derivatives => {
                sqlx::query(
                    "INSERT INTO contract_specs \
                       (symbol, product_type, base_coin, quote_coin, price_place, volume_place, \
                        min_trade_num, maker_fee_rate, taker_fee_rate, raw_data, fetched_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                     ON CONFLICT (symbol, product_type) DO UPDATE SET \
                       base_coin = EXCLUDED.base_coin, quote_coin = EXCLUDED.quote_coin, \
                       price_place = EXCLUDED.price_place, volume_place = EXCLUDED.volume_place, \
                       min_trade_num = EXCLUDED.min_trade_num, \
                       maker_fee_rate = EXCLUDED.maker_fee_rate, \
                       taker_fee_rate = EXCLUDED.taker_fee_rate, \
                       raw_data = EXCLUDED.raw_data, fetched_at = EXCLUDED.fetched_at",
                )
                .bind(&spec.symbol)
                .bind(PRODUCT_TYPE_USDT_FUTURES)
                .bind(&spec.base_coin)
                .bind(&spec.quote_coin)
                .bind(spec.price_place as i32)
                .bind(spec.volume_place as i32)
                .bind(spec.min_trade_num)
                .bind(spec.maker_fee_rate)
                .bind(spec.taker_fee_rate)
                .bind(raw)
                .bind(fetched_at)
                .execute(&self.pool)
                .await?;
            }
            VenueKind::Spot => {
                sqlx::query(
                    "INSERT INTO spot_specs \
                       (symbol, base_coin, quote_coin, price_place, volume_place, \
                        min_trade_num, maker_fee_rate, taker_fee_rate, raw_data, fetched_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                     ON CONFLICT (symbol) DO UPDATE SET \
                       base_coin = EXCLUDED.base_coin, quote_coin = EXCLUDED.quote_coin, \
                       price_place = EXCLUDED.price_place, volume_place = EXCLUDED.volume_place, \
                       min_trade_num = EXCLUDED.min_trade_num, \
                       maker_fee_rate = EXCLUDED.maker_fee_rate, \
                       taker_fee_rate = EXCLUDED.taker_fee_rate, \
                       raw_data = EXCLUDED.raw_data, fetched_at = EXCLUDED.fetched_at",
                )
                .bind(&spec.symbol)
                .bind(&spec.base_coin)
                .bind(&spec.quote_coin)
                .bind(spec.price_place as i32)
                .bind(spec.volume_place as i32)
                .bind(spec.min_trade_num)
                .bind(spec.maker_fee_rate)
                .bind(spec.taker_fee_rate)
                .bind(raw)
                .bind(fetched_at)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

fn is_fresh(fetched_at: DateTime<Utc>) -> bool {
    Utc::now() - fetched_at <= Duration::seconds(SPEC_TTL_SECS)
}
