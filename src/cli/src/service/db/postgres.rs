use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{migrate::Migrator, FromRow, Pool, Postgres, QueryBuilder};

use super::*;
use crate::config;

#[derive(Debug, Clone)]
pub(crate) struct PostgresStore {
  pool: Pool<Postgres>,
}

#[derive(Debug, Clone, FromRow)]
struct HistoryRow {
  date: NaiveDate,
  device_id: String,
  shift: Shift,
  total_target: i64,
  total_actual: i64,
}

#[derive(Debug, Clone, FromRow)]
struct HourlyRow {
  hour: i32,
  target: i64,
  actual: i64,
  downtime: i64,
}

#[derive(Debug, Clone, FromRow)]
struct SummaryRow {
  date: NaiveDate,
  device_id: String,
  shift: Shift,
  total_target: i64,
  total_actual: i64,
  total_downtime: i64,
}

#[derive(Debug, Clone, FromRow)]
struct TotalsRow {
  total_target: Option<i64>,
  total_actual: Option<i64>,
  total_downtime: Option<i64>,
}

impl From<SummaryRow> for DailySummary {
  fn from(row: SummaryRow) -> Self {
    Self {
      date: row.date,
      device_id: row.device_id,
      shift: row.shift,
      total_target: row.total_target,
      total_actual: row.total_actual,
      total_downtime: row.total_downtime,
    }
  }
}

impl PostgresStore {
  pub(crate) fn new(db: &config::Db) -> Self {
    let mut options = sqlx::postgres::PgConnectOptions::new()
      .host(&db.domain)
      .username(&db.user)
      .database(&db.name)
      .options([(
        "statement_timeout",
        db.timeout.num_milliseconds().to_string(),
      )]);

    if let Some(port) = db.port {
      options = options.port(port);
    }

    if let Some(password) = &db.password {
      options = options.password(password.as_str());
    }

    options = options.ssl_mode(sqlx::postgres::PgSslMode::Disable);
    if db.ssl {
      options = options.ssl_mode(sqlx::postgres::PgSslMode::Require);
    }

    let pool = sqlx::Pool::connect_lazy_with(options);

    Self { pool }
  }
}

#[async_trait::async_trait]
impl Store for PostgresStore {
  #[tracing::instrument(skip(self))]
  async fn migrate(&self) -> Result<(), MigrateError> {
    MIGRATOR.run(&self.pool).await?;

    tracing::info!("Migration ran successfully");

    Ok(())
  }

  #[tracing::instrument(skip_all, fields(device = %snapshot.device_id))]
  async fn insert_history(&self, snapshot: &Snapshot) -> Result<(), Error> {
    let Some(timestamp) = snapshot.timestamp else {
      return Ok(());
    };
    let mut transaction = self.pool.begin().await?;

    if snapshot.connected && !snapshot.registers.is_empty() {
      QueryBuilder::<Postgres>::new(
        "insert into register_history (device_id, timestamp, register_name, value)",
      )
      .push_values(&snapshot.registers, |mut binder, (register, value)| {
        binder
          .push_bind(&snapshot.device_id)
          .push_bind(timestamp)
          .push_bind(register.to_string())
          .push_bind(*value);
      })
      .build()
      .execute(&mut *transaction)
      .await?;
    }

    sqlx::query(
      r#"
        insert into connection_history (device_id, timestamp, connected, error)
        values ($1, $2, $3, $4)
      "#,
    )
    .bind(&snapshot.device_id)
    .bind(timestamp)
    .bind(snapshot.connected)
    .bind(&snapshot.error)
    .execute(&mut *transaction)
    .await?;

    transaction.commit().await?;

    tracing::trace!("Inserted history rows");

    Ok(())
  }

  #[tracing::instrument(skip(self))]
  async fn upsert_hourly(&self, record: &ShiftRecord) -> Result<(), Error> {
    sqlx::query(
      r#"
        insert into production_data
          (date, device_id, shift, hour, target, actual, downtime, saved_at)
        values ($1, $2, $3, $4, $5, $6, $7, now())
        on conflict (date, device_id, shift, hour) do update
        set target = excluded.target,
            actual = excluded.actual,
            downtime = excluded.downtime,
            saved_at = excluded.saved_at
      "#,
    )
    .bind(record.date)
    .bind(&record.device_id)
    .bind(record.shift)
    .bind(record.hour.value() as i32)
    .bind(record.target)
    .bind(record.actual)
    .bind(record.downtime)
    .execute(&self.pool)
    .await?;

    tracing::trace!("Upserted hourly record");

    Ok(())
  }

  #[tracing::instrument(skip(self))]
  async fn upsert_daily_summary(
    &self,
    summary: &DailySummary,
  ) -> Result<(), Error> {
    sqlx::query(
      r#"
        insert into daily_summary
          (date, device_id, shift, total_target, total_actual, total_downtime, saved_at)
        values ($1, $2, $3, $4, $5, $6, now())
        on conflict (date, device_id, shift) do update
        set total_target = excluded.total_target,
            total_actual = excluded.total_actual,
            total_downtime = excluded.total_downtime,
            saved_at = excluded.saved_at
      "#,
    )
    .bind(summary.date)
    .bind(&summary.device_id)
    .bind(summary.shift)
    .bind(summary.total_target)
    .bind(summary.total_actual)
    .bind(summary.total_downtime)
    .execute(&self.pool)
    .await?;

    tracing::trace!("Upserted daily summary");

    Ok(())
  }

  #[tracing::instrument(skip(self))]
  async fn summarize_shift(
    &self,
    date: NaiveDate,
    device_id: &str,
    shift: Shift,
  ) -> Result<Option<DailySummary>, Error> {
    let totals = sqlx::query_as::<_, TotalsRow>(
      r#"
        select sum(target)::bigint as total_target,
               sum(actual)::bigint as total_actual,
               sum(downtime)::bigint as total_downtime
        from production_data
        where date = $1 and device_id = $2 and shift = $3
      "#,
    )
    .bind(date)
    .bind(device_id)
    .bind(shift)
    .fetch_one(&self.pool)
    .await?;

    let summary = match totals {
      TotalsRow {
        total_target: Some(total_target),
        total_actual: Some(total_actual),
        total_downtime: Some(total_downtime),
      } => Some(DailySummary {
        date,
        device_id: device_id.to_owned(),
        shift,
        total_target,
        total_actual,
        total_downtime,
      }),
      _ => None,
    };

    tracing::trace!("Summarized shift");

    Ok(summary)
  }

  #[tracing::instrument(skip(self))]
  async fn get_history(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<HistoryEntry>, Error> {
    let rows = sqlx::query_as::<_, HistoryRow>(
      r#"
        select date, device_id, shift,
               sum(target)::bigint as total_target,
               sum(actual)::bigint as total_actual
        from production_data
        where date between $1 and $2
        group by date, device_id, shift
        order by date desc, device_id, shift
      "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(&self.pool)
    .await?;

    tracing::trace!("Fetched {} history rows", rows.len());

    Ok(
      rows
        .into_iter()
        .map(|row| {
          HistoryEntry::new(
            row.date,
            row.device_id,
            row.shift,
            row.total_target,
            row.total_actual,
          )
        })
        .collect(),
    )
  }

  #[tracing::instrument(skip(self))]
  async fn get_hourly(
    &self,
    date: NaiveDate,
    device_id: &str,
    shift: Shift,
  ) -> Result<Vec<HourlyEntry>, Error> {
    let rows = sqlx::query_as::<_, HourlyRow>(
      r#"
        select hour, target, actual, downtime
        from production_data
        where date = $1 and device_id = $2 and shift = $3
        order by hour
      "#,
    )
    .bind(date)
    .bind(device_id)
    .bind(shift)
    .fetch_all(&self.pool)
    .await?;

    tracing::trace!("Fetched {} hourly rows", rows.len());

    rows
      .into_iter()
      .map(|row| {
        let hour = Hour::new(u32::try_from(row.hour).unwrap_or(u32::MAX))?;
        Ok(HourlyEntry::new(hour, row.target, row.actual, row.downtime))
      })
      .collect()
  }

  #[tracing::instrument(skip(self))]
  async fn get_summaries(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<DailySummary>, Error> {
    let rows = sqlx::query_as::<_, SummaryRow>(
      r#"
        select date, device_id, shift, total_target, total_actual, total_downtime
        from daily_summary
        where date between $1 and $2
        order by date desc, device_id, shift
      "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(&self.pool)
    .await?;

    tracing::trace!("Fetched {} summaries", rows.len());

    Ok(rows.into_iter().map(DailySummary::from).collect())
  }

  #[tracing::instrument(skip(self))]
  async fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<Pruned, Error> {
    let mut transaction = self.pool.begin().await?;

    let registers =
      sqlx::query("delete from register_history where timestamp < $1")
        .bind(cutoff)
        .execute(&mut *transaction)
        .await?
        .rows_affected();
    let connections =
      sqlx::query("delete from connection_history where timestamp < $1")
        .bind(cutoff)
        .execute(&mut *transaction)
        .await?
        .rows_affected();

    transaction.commit().await?;

    tracing::trace!("Deleted {} register rows", registers);

    Ok(Pruned {
      registers,
      connections,
    })
  }

  #[tracing::instrument(skip(self))]
  async fn prune_production(&self, cutoff: NaiveDate) -> Result<u64, Error> {
    let mut transaction = self.pool.begin().await?;

    let hourly = sqlx::query("delete from production_data where date < $1")
      .bind(cutoff)
      .execute(&mut *transaction)
      .await?
      .rows_affected();
    let summaries = sqlx::query("delete from daily_summary where date < $1")
      .bind(cutoff)
      .execute(&mut *transaction)
      .await?
      .rows_affected();

    transaction.commit().await?;

    tracing::trace!("Deleted {} production rows", hourly + summaries);

    Ok(hourly + summaries)
  }
}

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");
