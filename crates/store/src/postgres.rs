use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use common::{BlockId, Clock, MarketId, OrderId, RequestId, StallId, SystemClock};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction, postgres::PgRow, types::Json};
use uuid::Uuid;

use crate::{
    Citizen, ExternalPayment, Occupant, OrderPatch, OrderReference, OrderState, Request,
    RequestPatch, RequestState, ReservationOrder, Result, Stall, StallState, StoreError,
    store::{OrderStore, RequestStore, StallRegistry},
};

/// PostgreSQL-backed implementation of all three stores.
///
/// `try_reserve` and the bulk sweeps are single conditional `UPDATE`s. Other
/// mutations lock the row with `SELECT ... FOR UPDATE`, check the expected
/// state, and write back inside the same transaction.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

type Tx = Transaction<'static, Postgres>;

fn codes<S: Copy>(states: &[S], as_str: fn(&S) -> &'static str) -> Vec<String> {
    states.iter().map(|s| as_str(s).to_string()).collect()
}

fn to_i64(sequence: u64) -> Result<i64> {
    i64::try_from(sequence)
        .map_err(|_| StoreError::Corrupt(format!("sequence {sequence} out of range")))
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Creates a store that stamps `updated_at` from `clock`.
    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_stall(row: &PgRow) -> Result<Stall> {
        let state: String = row.try_get("state")?;
        let tags: Json<Vec<String>> = row.try_get("tags")?;
        let current: Option<Json<Occupant>> = row.try_get("current_occupant")?;
        let history: Json<Vec<Occupant>> = row.try_get("occupant_history")?;

        Ok(Stall {
            id: StallId::from_uuid(row.try_get::<Uuid, _>("id")?),
            code: row.try_get("code")?,
            name: row.try_get("name")?,
            market_id: MarketId::from_uuid(row.try_get::<Uuid, _>("market_id")?),
            block_id: row
                .try_get::<Option<Uuid>, _>("block_id")?
                .map(BlockId::from_uuid),
            block_name: row.try_get("block_name")?,
            section: row.try_get("section")?,
            is_active: row.try_get("is_active")?,
            tags: tags.0,
            state: state.parse()?,
            reserved_until: row.try_get("reserved_until")?,
            current_occupant: current.map(|c| c.0),
            occupant_history: history.0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_request(row: &PgRow) -> Result<Request> {
        let state: String = row.try_get("state")?;
        let citizen: Json<Citizen> = row.try_get("citizen")?;

        Ok(Request {
            id: RequestId::from_uuid(row.try_get::<Uuid, _>("id")?),
            stall_id: StallId::from_uuid(row.try_get::<Uuid, _>("stall_id")?),
            market_id: MarketId::from_uuid(row.try_get::<Uuid, _>("market_id")?),
            market_name: row.try_get("market_name")?,
            section: row.try_get("section")?,
            citizen: citizen.0,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            state: state.parse()?,
            order_id: row
                .try_get::<Option<Uuid>, _>("order_id")?
                .map(OrderId::from_uuid),
            manual: row.try_get("manual")?,
            operator: row.try_get("operator")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_order(row: &PgRow) -> Result<ReservationOrder> {
        let state: String = row.try_get("state")?;
        let sequence: i64 = row.try_get("sequence")?;
        let reference: String = row.try_get("reference")?;
        let occupant: Json<Citizen> = row.try_get("occupant")?;
        let payment: Option<Json<ExternalPayment>> = row.try_get("external_payment")?;

        Ok(ReservationOrder {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            sequence: u64::try_from(sequence)
                .map_err(|_| StoreError::Corrupt(format!("negative sequence {sequence}")))?,
            reference: OrderReference::parse(&reference),
            stall_id: StallId::from_uuid(row.try_get::<Uuid, _>("stall_id")?),
            request_id: RequestId::from_uuid(row.try_get::<Uuid, _>("request_id")?),
            market_id: MarketId::from_uuid(row.try_get::<Uuid, _>("market_id")?),
            section: row.try_get("section")?,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            state: state.parse()?,
            approve_before: row.try_get("approve_before")?,
            release_at: row.try_get("release_at")?,
            occupant: occupant.0,
            external_payment: payment.map(|p| p.0),
            observation: row.try_get("observation")?,
            manual: row.try_get("manual")?,
            operator: row.try_get("operator")?,
            assigned_at: row.try_get("assigned_at")?,
            expired_at: row.try_get("expired_at")?,
            released_at: row.try_get("released_at")?,
            rejected_at: row.try_get("rejected_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn lock_stall(&self, id: StallId) -> Result<(Tx, Stall)> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM stalls WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("Stall", id))?;
        let stall = Self::row_to_stall(&row)?;
        Ok((tx, stall))
    }

    async fn write_stall(conn: &mut PgConnection, stall: &Stall) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE stalls
            SET state = $2, reserved_until = $3, current_occupant = $4,
                occupant_history = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(stall.id.as_uuid())
        .bind(stall.state.as_str())
        .bind(stall.reserved_until)
        .bind(stall.current_occupant.as_ref().map(Json))
        .bind(Json(&stall.occupant_history))
        .bind(stall.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Locks the stall, checks its state is in `from`, applies `update` and
    /// writes it back in one transaction.
    async fn update_stall_if<F>(&self, id: StallId, from: &[StallState], update: F) -> Result<Stall>
    where
        F: FnOnce(&mut Stall) + Send,
    {
        let (mut tx, mut stall) = self.lock_stall(id).await?;
        if !from.contains(&stall.state) {
            return Err(StoreError::state_conflict("Stall", id, from, stall.state));
        }
        update(&mut stall);
        stall.updated_at = self.clock.now();
        Self::write_stall(&mut tx, &stall).await?;
        tx.commit().await?;
        Ok(stall)
    }

    async fn fetch_orders(&self, sql: &str, now: DateTime<Utc>) -> Result<Vec<ReservationOrder>> {
        let rows = sqlx::query(sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_order).collect()
    }
}

fn free(stall: &mut Stall) {
    stall.state = StallState::Free;
    stall.reserved_until = None;
}

const ANY_STALL_STATE: [StallState; 3] =
    [StallState::Free, StallState::Reserved, StallState::Occupied];

#[async_trait]
impl StallRegistry for PostgresStore {
    async fn insert_stall(&self, stall: Stall) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stalls (id, code, name, market_id, block_id, block_name, section,
                                is_active, tags, state, reserved_until, current_occupant,
                                occupant_history, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(stall.id.as_uuid())
        .bind(&stall.code)
        .bind(&stall.name)
        .bind(stall.market_id.as_uuid())
        .bind(stall.block_id.map(|b| b.as_uuid()))
        .bind(&stall.block_name)
        .bind(&stall.section)
        .bind(stall.is_active)
        .bind(Json(&stall.tags))
        .bind(stall.state.as_str())
        .bind(stall.reserved_until)
        .bind(stall.current_occupant.as_ref().map(Json))
        .bind(Json(&stall.occupant_history))
        .bind(stall.created_at)
        .bind(stall.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stall(&self, id: StallId) -> Result<Option<Stall>> {
        let row = sqlx::query("SELECT * FROM stalls WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_stall).transpose()
    }

    async fn stall_by_external_code(&self, code: &str) -> Result<Option<Stall>> {
        let suffix = format!("T-{}", code.trim()).to_lowercase();
        let row = sqlx::query(
            r#"
            SELECT * FROM stalls
            WHERE RIGHT(LOWER(TRIM(code)), LENGTH($1)) = $1
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(suffix)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_stall).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn try_reserve(&self, id: StallId, until: DateTime<Utc>) -> Result<Stall> {
        let row = sqlx::query(
            r#"
            UPDATE stalls
            SET state = $2, reserved_until = $3, updated_at = $5
            WHERE id = $1 AND state = $4
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(StallState::Reserved.as_str())
        .bind(until)
        .bind(StallState::Free.as_str())
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::row_to_stall(&row);
        }

        // Nothing matched: tell a missing stall from a lost race.
        let actual: Option<String> = sqlx::query_scalar("SELECT state FROM stalls WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match actual {
            Some(state) => {
                metrics::counter!("stall_reservation_conflicts_total").increment(1);
                Err(StoreError::state_conflict(
                    "Stall",
                    id,
                    &[StallState::Free],
                    state.parse::<StallState>()?,
                ))
            }
            None => Err(StoreError::not_found("Stall", id)),
        }
    }

    async fn occupy(&self, id: StallId) -> Result<Stall> {
        self.update_stall_if(id, &StallState::OCCUPIABLE, |stall| {
            stall.state = StallState::Occupied;
            stall.reserved_until = None;
        })
        .await
    }

    async fn assign(&self, id: StallId, occupant: Occupant) -> Result<Stall> {
        self.update_stall_if(id, &StallState::OCCUPIABLE, move |stall| {
            stall.state = StallState::Occupied;
            stall.reserved_until = None;
            stall.current_occupant = Some(occupant);
        })
        .await
    }

    async fn release(&self, id: StallId) -> Result<Stall> {
        self.update_stall_if(id, &ANY_STALL_STATE, free).await
    }

    async fn release_reservation(&self, id: StallId) -> Result<Option<Stall>> {
        match self.update_stall_if(id, &[StallState::Reserved], free).await {
            Ok(stall) => Ok(Some(stall)),
            Err(e) if e.is_state_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_occupant(&self, id: StallId, occupant: Occupant) -> Result<Stall> {
        self.update_stall_if(id, &ANY_STALL_STATE, move |stall| {
            stall.current_occupant = Some(occupant);
        })
        .await
    }

    async fn close_occupant(
        &self,
        id: StallId,
        actual_end: DateTime<Utc>,
    ) -> Result<Option<Occupant>> {
        let (mut tx, mut stall) = self.lock_stall(id).await?;
        let Some(current) = stall.current_occupant.take() else {
            return Ok(None);
        };
        let closed = current.closed(actual_end);
        stall.occupant_history.push(closed.clone());
        stall.updated_at = self.clock.now();
        Self::write_stall(&mut tx, &stall).await?;
        tx.commit().await?;
        Ok(Some(closed))
    }

    async fn vacate(
        &self,
        id: StallId,
        national_id: &str,
        actual_end: DateTime<Utc>,
        fallback: Option<Occupant>,
    ) -> Result<Option<Stall>> {
        let (mut tx, mut stall) = self.lock_stall(id).await?;
        if !stall.is_held_by(national_id) {
            return Ok(None);
        }
        if let Some(record) = stall.current_occupant.take().or(fallback) {
            stall.occupant_history.push(record.closed(actual_end));
        }
        free(&mut stall);
        stall.updated_at = self.clock.now();
        Self::write_stall(&mut tx, &stall).await?;
        tx.commit().await?;
        Ok(Some(stall))
    }

    async fn release_lapsed_reservation(
        &self,
        id: StallId,
        now: DateTime<Utc>,
    ) -> Result<Option<Stall>> {
        let row = sqlx::query(
            r#"
            UPDATE stalls
            SET state = $2, reserved_until = NULL, updated_at = $4
            WHERE id = $1 AND state = $3 AND reserved_until <= $5
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(StallState::Free.as_str())
        .bind(StallState::Reserved.as_str())
        .bind(self.clock.now())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Self::row_to_stall(&row).map(Some),
            None if self.stall(id).await?.is_some() => Ok(None),
            None => Err(StoreError::not_found("Stall", id)),
        }
    }

    async fn release_expired_reservations(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stalls
            SET state = $1, reserved_until = NULL, updated_at = $4
            WHERE state = $2 AND reserved_until <= $3
            "#,
        )
        .bind(StallState::Free.as_str())
        .bind(StallState::Reserved.as_str())
        .bind(now)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn has_claim_for_citizen(&self, national_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM stalls WHERE occupant_national_id = $1 AND state = ANY($2))",
        )
        .bind(national_id)
        .bind(codes(&StallState::CLAIMED, StallState::as_str))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl RequestStore for PostgresStore {
    async fn insert_request(&self, request: Request) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO requests (id, stall_id, market_id, market_name, section, citizen,
                                  national_id, start_date, end_date, state, order_id, manual,
                                  operator, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(request.stall_id.as_uuid())
        .bind(request.market_id.as_uuid())
        .bind(&request.market_name)
        .bind(&request.section)
        .bind(Json(&request.citizen))
        .bind(&request.citizen.national_id)
        .bind(request.start_date)
        .bind(request.end_date)
        .bind(request.state.as_str())
        .bind(request.order_id.map(|o| o.as_uuid()))
        .bind(request.manual)
        .bind(&request.operator)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request(&self, id: RequestId) -> Result<Option<Request>> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_request).transpose()
    }

    async fn has_blocking_request_for_citizen(
        &self,
        national_id: &str,
        except: Option<RequestId>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM requests
                WHERE national_id = $1 AND state = ANY($2)
                  AND ($3::uuid IS NULL OR id <> $3)
            )
            "#,
        )
        .bind(national_id)
        .bind(codes(&RequestState::BLOCKING, RequestState::as_str))
        .bind(except.map(|id| id.as_uuid()))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn has_blocking_request_for_stall(&self, stall_id: StallId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM requests WHERE stall_id = $1 AND state = ANY($2))",
        )
        .bind(stall_id.as_uuid())
        .bind(codes(&RequestState::BLOCKING, RequestState::as_str))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn requests_in_state(&self, state: RequestState) -> Result<Vec<Request>> {
        let rows = sqlx::query("SELECT * FROM requests WHERE state = $1 ORDER BY created_at")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_request).collect()
    }

    async fn transition_request(
        &self,
        id: RequestId,
        from: Option<&[RequestState]>,
        to: RequestState,
        patch: RequestPatch,
    ) -> Result<Request> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM requests WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("Request", id))?;
        let mut request = Self::row_to_request(&row)?;

        if let Some(from) = from
            && !from.contains(&request.state)
        {
            return Err(StoreError::state_conflict("Request", id, from, request.state));
        }
        request.state = to;
        patch.apply(&mut request);
        request.updated_at = self.clock.now();

        sqlx::query(
            r#"
            UPDATE requests
            SET state = $2, order_id = $3, manual = $4, operator = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(request.state.as_str())
        .bind(request.order_id.map(|o| o.as_uuid()))
        .bind(request.manual)
        .bind(&request.operator)
        .bind(request.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(request)
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn next_sequence(&self) -> Result<u64> {
        let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM orders")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(max).unwrap_or(0) + 1)
    }

    async fn insert_order(&self, order: ReservationOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, sequence, reference, stall_id, request_id, market_id, section,
                                start_date, end_date, state, approve_before, release_at, occupant,
                                national_id, external_payment, observation, manual, operator,
                                assigned_at, expired_at, released_at, rejected_at,
                                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(to_i64(order.sequence)?)
        .bind(order.reference.as_str())
        .bind(order.stall_id.as_uuid())
        .bind(order.request_id.as_uuid())
        .bind(order.market_id.as_uuid())
        .bind(&order.section)
        .bind(order.start_date)
        .bind(order.end_date)
        .bind(order.state.as_str())
        .bind(order.approve_before)
        .bind(order.release_at)
        .bind(Json(&order.occupant))
        .bind(&order.occupant.national_id)
        .bind(order.external_payment.as_ref().map(Json))
        .bind(&order.observation)
        .bind(order.manual)
        .bind(&order.operator)
        .bind(order.assigned_at)
        .bind(order.expired_at)
        .bind(order.released_at)
        .bind(order.rejected_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_order_reference")
            {
                return StoreError::DuplicateReference(order.reference.to_string());
            }
            StoreError::Database(e)
        })?;
        Ok(())
    }

    async fn order(&self, id: OrderId) -> Result<Option<ReservationOrder>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn order_by_reference(
        &self,
        reference: &OrderReference,
    ) -> Result<Option<ReservationOrder>> {
        let row = sqlx::query("SELECT * FROM orders WHERE reference = $1")
            .bind(reference.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn transition_order(
        &self,
        id: OrderId,
        from: &[OrderState],
        to: OrderState,
        at: DateTime<Utc>,
        patch: OrderPatch,
    ) -> Result<ReservationOrder> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("Order", id))?;
        let mut order = Self::row_to_order(&row)?;

        if !from.contains(&order.state) {
            return Err(StoreError::state_conflict("Order", id, from, order.state));
        }
        order.state = to;
        order.stamp(to, at);
        patch.apply(&mut order);
        order.updated_at = at;

        sqlx::query(
            r#"
            UPDATE orders
            SET state = $2, release_at = $3, external_payment = $4, observation = $5,
                manual = $6, operator = $7, assigned_at = $8, expired_at = $9,
                released_at = $10, rejected_at = $11, updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.state.as_str())
        .bind(order.release_at)
        .bind(order.external_payment.as_ref().map(Json))
        .bind(&order.observation)
        .bind(order.manual)
        .bind(&order.operator)
        .bind(order.assigned_at)
        .bind(order.expired_at)
        .bind(order.released_at)
        .bind(order.rejected_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(order)
    }

    async fn set_payment(&self, id: OrderId, payment: ExternalPayment) -> Result<ReservationOrder> {
        let row = sqlx::query(
            "UPDATE orders SET external_payment = $2, updated_at = $3 WHERE id = $1 RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(Json(&payment))
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("Order", id))?;
        Self::row_to_order(&row)
    }

    async fn orders_due_for_expiry(&self, now: DateTime<Utc>) -> Result<Vec<ReservationOrder>> {
        self.fetch_orders(
            "SELECT * FROM orders WHERE state = 'EN_SOLICITUD' AND approve_before <= $1 ORDER BY sequence",
            now,
        )
        .await
    }

    async fn orders_due_for_release(&self, now: DateTime<Utc>) -> Result<Vec<ReservationOrder>> {
        self.fetch_orders(
            r#"
            SELECT * FROM orders
            WHERE state IN ('ASIGNADA', 'OCUPADA')
              AND ((release_at IS NOT NULL AND release_at <= $1) OR end_date <= $1)
            ORDER BY sequence
            "#,
            now,
        )
        .await
    }

    async fn expire_overdue_orders(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET state = $1, expired_at = $2, updated_at = $2
            WHERE state = $3 AND approve_before <= $2
            "#,
        )
        .bind(OrderState::Expired.as_str())
        .bind(now)
        .bind(OrderState::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn has_active_order_for_citizen(&self, national_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM orders WHERE national_id = $1 AND state = ANY($2))",
        )
        .bind(national_id)
        .bind(codes(&OrderState::ACTIVE, OrderState::as_str))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn pending_order_for(
        &self,
        national_id: &str,
        stall_id: StallId,
    ) -> Result<Option<ReservationOrder>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE national_id = $1 AND stall_id = $2 AND state = $3
            ORDER BY created_at DESC, sequence DESC
            LIMIT 1
            "#,
        )
        .bind(national_id)
        .bind(stall_id.as_uuid())
        .bind(OrderState::Pending.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn latest_pending_order_for_stall(
        &self,
        stall_id: StallId,
    ) -> Result<Option<ReservationOrder>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE stall_id = $1 AND state = $2
            ORDER BY created_at DESC, sequence DESC
            LIMIT 1
            "#,
        )
        .bind(stall_id.as_uuid())
        .bind(OrderState::Pending.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_order).transpose()
    }
}
