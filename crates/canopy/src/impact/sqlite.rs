//! SQLite implementation of the shop store and impact ledger.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::budget::SPEND_TOLERANCE;
use super::defaults::SOURCE_SYSTEM;
use super::domain::{
    CustomerImpact, FlowActionLog, ImpactLedgerEntry, ImpactSource, ImpactTotals,
    LoyaltyRedemption, NewLedgerEntry, OrderEvent, RecordOutcome, Shop, ShopId,
    ShopRegistration, ShopSettings, SpendCharge, WidgetPlacement, WidgetSettings,
};
use super::repository::{ImpactLedger, RepositoryError, ShopStore};

const REDACTED_CUSTOMER: &str = "redacted";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS shops (
        id TEXT PRIMARY KEY,
        domain TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        company_id TEXT,
        access_token TEXT,
        installed_at TEXT NOT NULL,
        uninstalled_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS shop_settings (
        shop_id TEXT PRIMARY KEY,
        is_enabled INTEGER NOT NULL,
        is_paused INTEGER NOT NULL,
        order_event TEXT NOT NULL,
        minimum_order_value REAL,
        rules TEXT NOT NULL,
        cost_per_tree REAL NOT NULL,
        cost_per_kg_co2 REAL NOT NULL,
        monthly_budget REAL,
        monthly_spent REAL NOT NULL DEFAULT 0,
        spend_period TEXT,
        notify_on_limit INTEGER NOT NULL,
        auto_resume_monthly INTEGER NOT NULL,
        loyalty_enabled INTEGER NOT NULL,
        points_per_tree INTEGER NOT NULL,
        loyalty_api_key TEXT,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS widget_settings (
        shop_id TEXT PRIMARY KEY,
        show_trees INTEGER NOT NULL,
        show_co2 INTEGER NOT NULL,
        headline TEXT NOT NULL,
        accent_color TEXT NOT NULL,
        placement TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS loyalty_redemptions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        shop_id TEXT NOT NULL,
        customer_id TEXT NOT NULL,
        email TEXT,
        points_spent INTEGER NOT NULL,
        trees_planted INTEGER NOT NULL,
        loyalty_app TEXT NOT NULL,
        reference_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (shop_id, reference_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_loyalty_redemptions_customer
        ON loyalty_redemptions (shop_id, customer_id)",
    "CREATE TABLE IF NOT EXISTS flow_action_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        shop_id TEXT NOT NULL,
        action TEXT NOT NULL,
        action_run_id TEXT NOT NULL,
        requested REAL NOT NULL,
        trees_planted INTEGER NOT NULL,
        co2_offset_kg REAL NOT NULL,
        cost REAL NOT NULL,
        status TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS impact_ledger (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_system TEXT NOT NULL,
        source_type TEXT NOT NULL,
        source_id TEXT NOT NULL,
        reference_id TEXT NOT NULL,
        trees_planted INTEGER NOT NULL,
        co2_offset_kg REAL NOT NULL,
        metadata TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (source_system, source_type, source_id, reference_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_impact_ledger_source
        ON impact_ledger (source_system, source_id, created_at)",
];

/// SQLite-backed storage shared by every entry point.
#[derive(Debug, Clone)]
pub struct SqliteImpactStore {
    pool: SqlitePool,
}

impl SqliteImpactStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `url` and applies the schema.
    pub async fn connect(url: &str) -> Result<Self, RepositoryError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database; one long-lived connection keeps it alive.
    pub async fn in_memory() -> Result<Self, RepositoryError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn shop_by_domain(&self, domain: &str) -> Result<Option<Shop>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM shops WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(shop_from_row).transpose()
    }

    async fn write_guarded(
        &self,
        entry: NewLedgerEntry,
        charge: SpendCharge,
        redemption: Option<LoyaltyRedemption>,
    ) -> Result<RecordOutcome, RepositoryError> {
        let now = timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        let Some(entry_id) = insert_entry(&mut tx, &entry, &now).await? else {
            tx.rollback().await?;
            return Ok(RecordOutcome::Duplicate);
        };

        let Some(monthly_spent) = charge_spend(&mut tx, &entry.shop_id, &charge, &now).await?
        else {
            tx.rollback().await?;
            return Ok(RecordOutcome::BudgetExceeded);
        };

        if let Some(redemption) = redemption {
            insert_redemption(&mut tx, &redemption).await?;
        }

        tx.commit().await?;
        Ok(RecordOutcome::Recorded {
            entry_id,
            monthly_spent,
        })
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| RepositoryError::Corrupt(format!("timestamp '{raw}': {err}")))
}

fn non_negative_u32(value: i64, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::Corrupt(format!("{column} out of range: {value}")))
}

fn non_negative_u64(value: i64, column: &str) -> Result<u64, RepositoryError> {
    u64::try_from(value)
        .map_err(|_| RepositoryError::Corrupt(format!("{column} out of range: {value}")))
}

fn shop_from_row(row: &SqliteRow) -> Result<Shop, RepositoryError> {
    let installed_at: String = row.try_get("installed_at")?;
    let uninstalled_at: Option<String> = row.try_get("uninstalled_at")?;

    Ok(Shop {
        id: ShopId(row.try_get("id")?),
        domain: row.try_get("domain")?,
        name: row.try_get("name")?,
        company_id: row.try_get("company_id")?,
        access_token: row.try_get("access_token")?,
        installed_at: parse_timestamp(&installed_at)?,
        uninstalled_at: uninstalled_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
    })
}

fn settings_from_row(row: &SqliteRow) -> Result<ShopSettings, RepositoryError> {
    let order_event: String = row.try_get("order_event")?;
    let rules: String = row.try_get("rules")?;
    let points_per_tree: i64 = row.try_get("points_per_tree")?;

    Ok(ShopSettings {
        is_enabled: row.try_get("is_enabled")?,
        is_paused: row.try_get("is_paused")?,
        order_event: OrderEvent::from_label(&order_event)
            .ok_or_else(|| RepositoryError::Corrupt(format!("order event '{order_event}'")))?,
        minimum_order_value: row.try_get("minimum_order_value")?,
        rules: serde_json::from_str(&rules)
            .map_err(|err| RepositoryError::Corrupt(format!("trigger rules: {err}")))?,
        cost_per_tree: row.try_get("cost_per_tree")?,
        cost_per_kg_co2: row.try_get("cost_per_kg_co2")?,
        monthly_budget: row.try_get("monthly_budget")?,
        monthly_spent: row.try_get("monthly_spent")?,
        spend_period: row.try_get("spend_period")?,
        notify_on_limit: row.try_get("notify_on_limit")?,
        auto_resume_monthly: row.try_get("auto_resume_monthly")?,
        loyalty_enabled: row.try_get("loyalty_enabled")?,
        points_per_tree: non_negative_u32(points_per_tree, "points_per_tree")?,
        loyalty_api_key: row.try_get("loyalty_api_key")?,
    })
}

fn widget_from_row(row: &SqliteRow) -> Result<WidgetSettings, RepositoryError> {
    let placement: String = row.try_get("placement")?;
    Ok(WidgetSettings {
        show_trees: row.try_get("show_trees")?,
        show_co2: row.try_get("show_co2")?,
        headline: row.try_get("headline")?,
        accent_color: row.try_get("accent_color")?,
        placement: WidgetPlacement::from_label(&placement)
            .ok_or_else(|| RepositoryError::Corrupt(format!("widget placement '{placement}'")))?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<ImpactLedgerEntry, RepositoryError> {
    let source_type: String = row.try_get("source_type")?;
    let trees: i64 = row.try_get("trees_planted")?;
    let metadata: String = row.try_get("metadata")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(ImpactLedgerEntry {
        id: row.try_get("id")?,
        source_system: row.try_get("source_system")?,
        source: ImpactSource::from_label(&source_type)
            .ok_or_else(|| RepositoryError::Corrupt(format!("source type '{source_type}'")))?,
        shop_id: ShopId(row.try_get("source_id")?),
        reference_id: row.try_get("reference_id")?,
        trees_planted: non_negative_u32(trees, "trees_planted")?,
        co2_offset_kg: row.try_get("co2_offset_kg")?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|err| RepositoryError::Corrupt(format!("ledger metadata: {err}")))?,
        created_at: parse_timestamp(&created_at)?,
    })
}

async fn insert_default_settings(
    conn: &mut SqliteConnection,
    shop_id: &ShopId,
    now: &str,
) -> Result<(), RepositoryError> {
    let settings = ShopSettings::default();
    let rules = serde_json::to_string(&settings.rules)
        .map_err(|err| RepositoryError::Corrupt(format!("trigger rules: {err}")))?;

    sqlx::query(
        "INSERT INTO shop_settings (
            shop_id, is_enabled, is_paused, order_event, minimum_order_value, rules,
            cost_per_tree, cost_per_kg_co2, monthly_budget, monthly_spent, spend_period,
            notify_on_limit, auto_resume_monthly, loyalty_enabled, points_per_tree,
            loyalty_api_key, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, ?, ?, NULL, ?)
        ON CONFLICT (shop_id) DO NOTHING",
    )
    .bind(&shop_id.0)
    .bind(settings.is_enabled)
    .bind(settings.is_paused)
    .bind(settings.order_event.label())
    .bind(settings.minimum_order_value)
    .bind(rules)
    .bind(settings.cost_per_tree)
    .bind(settings.cost_per_kg_co2)
    .bind(settings.monthly_budget)
    .bind(settings.notify_on_limit)
    .bind(settings.auto_resume_monthly)
    .bind(settings.loyalty_enabled)
    .bind(i64::from(settings.points_per_tree))
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let widget = WidgetSettings::default();
    sqlx::query(
        "INSERT INTO widget_settings (
            shop_id, show_trees, show_co2, headline, accent_color, placement, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (shop_id) DO NOTHING",
    )
    .bind(&shop_id.0)
    .bind(widget.show_trees)
    .bind(widget.show_co2)
    .bind(&widget.headline)
    .bind(&widget.accent_color)
    .bind(widget.placement.label())
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Returns the new row id, or `None` when the reference was already recorded.
async fn insert_entry(
    conn: &mut SqliteConnection,
    entry: &NewLedgerEntry,
    now: &str,
) -> Result<Option<i64>, RepositoryError> {
    let result = sqlx::query(
        "INSERT INTO impact_ledger (
            source_system, source_type, source_id, reference_id,
            trees_planted, co2_offset_kg, metadata, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (source_system, source_type, source_id, reference_id) DO NOTHING",
    )
    .bind(SOURCE_SYSTEM)
    .bind(entry.source.as_str())
    .bind(&entry.shop_id.0)
    .bind(&entry.reference_id)
    .bind(i64::from(entry.trees_planted))
    .bind(entry.co2_offset_kg)
    .bind(entry.metadata.to_string())
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        Ok(None)
    } else {
        Ok(Some(result.last_insert_rowid()))
    }
}

/// Compare-and-increment of monthly spend; the budget predicate runs in SQLite.
///
/// Returns the new month-to-date spend, or `None` when the charge does not fit.
async fn charge_spend(
    conn: &mut SqliteConnection,
    shop_id: &ShopId,
    charge: &SpendCharge,
    now: &str,
) -> Result<Option<f64>, RepositoryError> {
    let result = sqlx::query(
        "UPDATE shop_settings
        SET monthly_spent = (CASE WHEN spend_period = ? THEN monthly_spent ELSE 0 END) + ?,
            spend_period = ?,
            updated_at = ?
        WHERE shop_id = ?
          AND (monthly_budget IS NULL
               OR (CASE WHEN spend_period = ? THEN monthly_spent ELSE 0 END) + ?
                  <= monthly_budget + ?)",
    )
    .bind(&charge.period)
    .bind(charge.amount)
    .bind(&charge.period)
    .bind(now)
    .bind(&shop_id.0)
    .bind(&charge.period)
    .bind(charge.amount)
    .bind(SPEND_TOLERANCE)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    let spent: f64 = sqlx::query("SELECT monthly_spent FROM shop_settings WHERE shop_id = ?")
        .bind(&shop_id.0)
        .fetch_one(&mut *conn)
        .await?
        .try_get("monthly_spent")?;
    Ok(Some(spent))
}

async fn insert_redemption(
    conn: &mut SqliteConnection,
    redemption: &LoyaltyRedemption,
) -> Result<(), RepositoryError> {
    let points = i64::try_from(redemption.points_spent)
        .map_err(|_| RepositoryError::Corrupt("points_spent exceeds i64".to_string()))?;

    sqlx::query(
        "INSERT INTO loyalty_redemptions (
            shop_id, customer_id, email, points_spent, trees_planted,
            loyalty_app, reference_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&redemption.shop_id.0)
    .bind(&redemption.customer_id)
    .bind(&redemption.email)
    .bind(points)
    .bind(i64::from(redemption.trees_planted))
    .bind(&redemption.loyalty_app)
    .bind(&redemption.reference_id)
    .bind(timestamp(redemption.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl ShopStore for SqliteImpactStore {
    async fn register_shop(&self, registration: ShopRegistration) -> Result<Shop, RepositoryError> {
        let now = timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query("SELECT id FROM shops WHERE domain = ?")
            .bind(&registration.domain)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get("id"))
            .transpose()?;

        let shop_id = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE shops
                    SET name = ?, company_id = ?,
                        access_token = COALESCE(?, access_token),
                        installed_at = ?, uninstalled_at = NULL
                    WHERE id = ?",
                )
                .bind(&registration.name)
                .bind(&registration.company_id)
                .bind(&registration.access_token)
                .bind(&now)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                ShopId(id)
            }
            None => {
                let id = ShopId::generate();
                sqlx::query(
                    "INSERT INTO shops (id, domain, name, company_id, access_token, installed_at)
                    VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&id.0)
                .bind(&registration.domain)
                .bind(&registration.name)
                .bind(&registration.company_id)
                .bind(&registration.access_token)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                id
            }
        };

        insert_default_settings(&mut tx, &shop_id, &now).await?;
        tx.commit().await?;

        self.shop_by_domain(&registration.domain)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    async fn find_shop(&self, domain: &str) -> Result<Option<Shop>, RepositoryError> {
        self.shop_by_domain(domain).await
    }

    async fn mark_uninstalled(
        &self,
        shop_id: &ShopId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE shops SET uninstalled_at = ?, access_token = NULL WHERE id = ?")
                .bind(timestamp(at))
                .bind(&shop_id.0)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn settings(&self, shop_id: &ShopId) -> Result<ShopSettings, RepositoryError> {
        let row = sqlx::query("SELECT * FROM shop_settings WHERE shop_id = ?")
            .bind(&shop_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        settings_from_row(&row)
    }

    async fn save_settings(
        &self,
        shop_id: &ShopId,
        settings: &ShopSettings,
    ) -> Result<(), RepositoryError> {
        let rules = serde_json::to_string(&settings.rules)
            .map_err(|err| RepositoryError::Corrupt(format!("trigger rules: {err}")))?;

        let result = sqlx::query(
            "UPDATE shop_settings
            SET is_enabled = ?, is_paused = ?, order_event = ?, minimum_order_value = ?,
                rules = ?, cost_per_tree = ?, cost_per_kg_co2 = ?, monthly_budget = ?,
                notify_on_limit = ?, auto_resume_monthly = ?, loyalty_enabled = ?,
                points_per_tree = ?, loyalty_api_key = ?, updated_at = ?
            WHERE shop_id = ?",
        )
        .bind(settings.is_enabled)
        .bind(settings.is_paused)
        .bind(settings.order_event.label())
        .bind(settings.minimum_order_value)
        .bind(rules)
        .bind(settings.cost_per_tree)
        .bind(settings.cost_per_kg_co2)
        .bind(settings.monthly_budget)
        .bind(settings.notify_on_limit)
        .bind(settings.auto_resume_monthly)
        .bind(settings.loyalty_enabled)
        .bind(i64::from(settings.points_per_tree))
        .bind(&settings.loyalty_api_key)
        .bind(timestamp(Utc::now()))
        .bind(&shop_id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_paused(&self, shop_id: &ShopId, paused: bool) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE shop_settings SET is_paused = ?, updated_at = ? WHERE shop_id = ?")
                .bind(paused)
                .bind(timestamp(Utc::now()))
                .bind(&shop_id.0)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn reset_monthly_spend(
        &self,
        shop_id: &ShopId,
        period: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE shop_settings
            SET monthly_spent = 0, spend_period = ?, updated_at = ?
            WHERE shop_id = ?",
        )
        .bind(period)
        .bind(timestamp(Utc::now()))
        .bind(&shop_id.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn widget_settings(&self, shop_id: &ShopId) -> Result<WidgetSettings, RepositoryError> {
        let row = sqlx::query("SELECT * FROM widget_settings WHERE shop_id = ?")
            .bind(&shop_id.0)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => widget_from_row(&row),
            None => Ok(WidgetSettings::default()),
        }
    }

    async fn save_widget_settings(
        &self,
        shop_id: &ShopId,
        widget: &WidgetSettings,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO widget_settings (
                shop_id, show_trees, show_co2, headline, accent_color, placement, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (shop_id) DO UPDATE SET
                show_trees = excluded.show_trees,
                show_co2 = excluded.show_co2,
                headline = excluded.headline,
                accent_color = excluded.accent_color,
                placement = excluded.placement,
                updated_at = excluded.updated_at",
        )
        .bind(&shop_id.0)
        .bind(widget.show_trees)
        .bind(widget.show_co2)
        .bind(&widget.headline)
        .bind(&widget.accent_color)
        .bind(widget.placement.label())
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn redact_shop(&self, shop_id: &ShopId) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for statement in [
            "DELETE FROM shop_settings WHERE shop_id = ?",
            "DELETE FROM widget_settings WHERE shop_id = ?",
            "DELETE FROM loyalty_redemptions WHERE shop_id = ?",
            "DELETE FROM flow_action_logs WHERE shop_id = ?",
            "DELETE FROM shops WHERE id = ?",
        ] {
            sqlx::query(statement)
                .bind(&shop_id.0)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ImpactLedger for SqliteImpactStore {
    async fn record_impact(
        &self,
        entry: NewLedgerEntry,
        charge: SpendCharge,
    ) -> Result<RecordOutcome, RepositoryError> {
        self.write_guarded(entry, charge, None).await
    }

    async fn record_redemption(
        &self,
        redemption: LoyaltyRedemption,
        entry: NewLedgerEntry,
        charge: SpendCharge,
    ) -> Result<RecordOutcome, RepositoryError> {
        self.write_guarded(entry, charge, Some(redemption)).await
    }

    async fn log_flow_action(&self, log: FlowActionLog) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO flow_action_logs (
                shop_id, action, action_run_id, requested, trees_planted,
                co2_offset_kg, cost, status, message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&log.shop_id.0)
        .bind(log.action.as_str())
        .bind(&log.action_run_id)
        .bind(log.requested)
        .bind(i64::from(log.trees_planted))
        .bind(log.co2_offset_kg)
        .bind(log.cost)
        .bind(log.status.as_str())
        .bind(&log.message)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn totals(&self, shop_id: &ShopId) -> Result<ImpactTotals, RepositoryError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(trees_planted), 0) AS trees,
                    COALESCE(SUM(co2_offset_kg), 0.0) AS co2,
                    COUNT(*) AS entries
            FROM impact_ledger
            WHERE source_system = ? AND source_id = ?",
        )
        .bind(SOURCE_SYSTEM)
        .bind(&shop_id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(ImpactTotals {
            trees_planted: non_negative_u64(row.try_get("trees")?, "trees_planted")?,
            co2_offset_kg: row.try_get("co2")?,
            entries: non_negative_u64(row.try_get("entries")?, "entries")?,
        })
    }

    async fn entries(
        &self,
        shop_id: &ShopId,
        limit: Option<u32>,
    ) -> Result<Vec<ImpactLedgerEntry>, RepositoryError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            "SELECT * FROM impact_ledger
            WHERE source_system = ? AND source_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?",
        )
        .bind(SOURCE_SYSTEM)
        .bind(&shop_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn customer_impact(
        &self,
        shop_id: &ShopId,
        customer_id: &str,
    ) -> Result<CustomerImpact, RepositoryError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(trees_planted), 0) AS trees,
                    COALESCE(SUM(points_spent), 0) AS points,
                    COUNT(*) AS redemptions
            FROM loyalty_redemptions
            WHERE shop_id = ? AND customer_id = ?",
        )
        .bind(&shop_id.0)
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(CustomerImpact {
            customer_id: customer_id.to_string(),
            trees_planted: non_negative_u64(row.try_get("trees")?, "trees_planted")?,
            points_spent: non_negative_u64(row.try_get("points")?, "points_spent")?,
            redemptions: non_negative_u64(row.try_get("redemptions")?, "redemptions")?,
        })
    }

    async fn redact_customer(
        &self,
        shop_id: &ShopId,
        customer_id: &str,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE loyalty_redemptions
            SET customer_id = ?, email = NULL
            WHERE shop_id = ? AND customer_id = ?",
        )
        .bind(REDACTED_CUSTOMER)
        .bind(&shop_id.0)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
