//! Read-only HTTP projection of the ledger.

use crate::error::IndexerError;
use crate::repository::models::{BlockRef, Holder, Transaction, TransferEvent};
use crate::repository::{
    BlockRepository, Database, DayActivity, HolderRepository, TransactionRepository,
    TransferRepository,
};
use alloy_primitives::{Address, B256};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

const DEFAULT_LIMIT: usize = 15;
const MAX_LIMIT: usize = 100;
const ACTIVITY_DAYS: usize = 7;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/info", get(info))
        .route("/holder/{address}", get(holder))
        .route("/tx/{hash}", get(transaction))
        .route("/txs", get(transactions))
        .route("/top", get(top))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub status: u16,
    pub timestamp: u64,
    pub data: T,
}

impl<T> Envelope<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            status: StatusCode::OK.as_u16(),
            timestamp: now_secs(),
            data,
        })
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub page: Option<usize>,
}

impl PageQuery {
    /// Limit, page and row offset after applying defaults and bounds.
    /// Offsets SQLite cannot address are rejected.
    fn resolve(&self) -> Result<(usize, usize, usize), ApiError> {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let page = self.page.unwrap_or(1).max(1);
        let offset = (page - 1)
            .checked_mul(limit)
            .filter(|offset| i64::try_from(*offset).is_ok())
            .ok_or_else(|| ApiError::BadRequest(format!("page out of range: {page}")))?;
        Ok((limit, page, offset))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoData {
    pub holders_count: usize,
    pub latest_block: Option<BlockRef>,
    pub days_activity: Vec<DayActivity>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderData {
    pub holder: Holder,
    pub transfers: Page<TransferEvent>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(IndexerError),
}

impl From<IndexerError> for ApiError {
    fn from(err: IndexerError) -> Self {
        ApiError::Internal(err)
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(e) => {
                error!("API request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Envelope::<Option<()>> {
            status: status.as_u16(),
            timestamp: now_secs(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

async fn read<T, F>(db: &Database, query: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, ApiError> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || query(&db.lock()))
        .await
        .map_err(|e| ApiError::Internal(e.into()))?
}

fn parse<T: FromStr>(kind: &str, raw: &str) -> Result<T, ApiError> {
    T::from_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid {kind}: {raw}")))
}

pub async fn info(State(state): State<AppState>) -> ApiResult<InfoData> {
    let data = read(&state.db, |conn| {
        Ok(InfoData {
            holders_count: HolderRepository::new(conn).count()?,
            latest_block: BlockRepository::new(conn).get_latest()?,
            days_activity: TransferRepository::new(conn).get_days_activity(ACTIVITY_DAYS)?,
        })
    })
    .await?;
    Ok(Envelope::ok(data))
}

pub async fn holder(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<HolderData> {
    let address: Address = parse("address", &address)?;
    let (limit, page, offset) = page.resolve()?;

    let data = read(&state.db, move |conn| {
        let holder = HolderRepository::new(conn)
            .get(&address)?
            .ok_or_else(|| ApiError::NotFound(format!("holder {address:?}")))?;
        let (items, total) =
            TransferRepository::new(conn).get_address_history(&address, limit, offset)?;
        Ok(HolderData {
            holder,
            transfers: Page {
                items,
                total,
                page,
                limit,
            },
        })
    })
    .await?;
    Ok(Envelope::ok(data))
}

pub async fn transaction(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Transaction> {
    let hash: B256 = parse("transaction hash", &hash)?;

    let data = read(&state.db, move |conn| {
        let mut transaction = TransactionRepository::new(conn)
            .get_by_hash(&hash)?
            .ok_or_else(|| ApiError::NotFound(format!("transaction {hash:?}")))?;
        transaction.transfers = TransferRepository::new(conn).get_by_tx_hash(&hash)?;
        Ok(transaction)
    })
    .await?;
    Ok(Envelope::ok(data))
}

pub async fn transactions(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Page<TransferEvent>> {
    let (limit, page, offset) = page.resolve()?;
    let data = read(&state.db, move |conn| {
        let (items, total) = TransferRepository::new(conn).get_processed_page(limit, offset)?;
        Ok(Page {
            items,
            total,
            page,
            limit,
        })
    })
    .await?;
    Ok(Envelope::ok(data))
}

pub async fn top(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Page<Holder>> {
    let (limit, page, offset) = page.resolve()?;
    let data = read(&state.db, move |conn| {
        let holders = HolderRepository::new(conn);
        Ok(Page {
            items: holders.get_top(limit, offset)?,
            total: holders.count()?,
            page,
            limit,
        })
    })
    .await?;
    Ok(Envelope::ok(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::BalanceAggregator;
    use crate::config::test_config;
    use crate::ingestion::PollStep;
    use crate::repository::{SqliteLedger, StateUpdate};
    use crate::test_utils::{addr, make_chain, transfer};
    use alloy_primitives::U256;

    async fn seeded() -> (AppState, Vec<crate::repository::Block>) {
        let config = test_config();
        let db = Database::in_memory().unwrap();
        let blocks = make_chain(
            1,
            0,
            &[
                vec![transfer(0, 1, 1000)],
                vec![transfer(1, 2, 250), transfer(1, 3, 50)],
            ],
        );
        SqliteLedger::from_config(db.clone(), &config)
            .apply_state(StateUpdate {
                incoming_blocks: blocks.clone(),
                reversed_block_hashes: vec![],
            })
            .await
            .unwrap();
        BalanceAggregator::new(db.clone(), &config)
            .execute()
            .await
            .unwrap();
        (AppState { db }, blocks)
    }

    #[test]
    fn page_query_defaults_and_caps() {
        assert_eq!(PageQuery::default().resolve().unwrap(), (15, 1, 0));
        let query = PageQuery {
            limit: Some(500),
            page: Some(3),
        };
        assert_eq!(query.resolve().unwrap(), (100, 3, 200));
        let query = PageQuery {
            limit: Some(0),
            page: Some(0),
        };
        assert_eq!(query.resolve().unwrap(), (1, 1, 0));
    }

    #[tokio::test]
    async fn unaddressable_page_is_bad_request() {
        let (state, _) = seeded().await;
        let query = PageQuery {
            limit: Some(100),
            page: Some(usize::MAX),
        };
        assert!(matches!(query.resolve(), Err(ApiError::BadRequest(_))));

        let response = transactions(State(state.clone()), Query(query))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let far = PageQuery {
            limit: Some(100),
            page: Some(1_000_000),
        };
        let Json(body) = top(State(state), Query(far)).await.unwrap();
        assert!(body.data.items.is_empty());
        assert_eq!(body.data.total, 4);
    }

    #[tokio::test]
    async fn holder_returns_balance_and_history() {
        let (state, _) = seeded().await;
        let Json(body) = holder(
            State(state),
            Path(format!("{:?}", addr(1))),
            Query(PageQuery::default()),
        )
        .await
        .unwrap();

        assert_eq!(body.status, 200);
        assert_eq!(body.data.holder.incoming_sum, U256::from(1000));
        assert_eq!(body.data.holder.outgoing_sum, U256::from(300));
        assert_eq!(body.data.transfers.total, 3);
        assert_eq!(body.data.transfers.items[0].block_height, 2);
    }

    #[tokio::test]
    async fn missing_entities_are_404() {
        let (state, _) = seeded().await;
        let response = holder(
            State(state.clone()),
            Path(format!("{:?}", addr(9))),
            Query(PageQuery::default()),
        )
        .await
        .unwrap_err()
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = transaction(State(state.clone()), Path(format!("{:?}", B256::ZERO)))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = transaction(State(state), Path("0x1234".to_string()))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn transaction_includes_its_transfers() {
        let (state, blocks) = seeded().await;
        let hash = blocks[1].transactions[1].hash;
        let Json(body) = transaction(State(state), Path(format!("{hash:?}")))
            .await
            .unwrap();

        assert_eq!(body.data.hash, hash);
        assert_eq!(body.data.transfers.len(), 1);
        assert_eq!(body.data.transfers[0].to, addr(3));
    }

    #[tokio::test]
    async fn top_and_info_reflect_holders() {
        let (state, _) = seeded().await;
        let Json(body) = top(State(state.clone()), Query(PageQuery::default()))
            .await
            .unwrap();
        assert_eq!(body.data.total, 4);
        assert_eq!(body.data.items[0].address, addr(1));

        let Json(body) = info(State(state)).await.unwrap();
        assert_eq!(body.data.holders_count, 4);
        assert_eq!(body.data.latest_block.unwrap().height, 2);
        // dates are filled by the backfill step
        assert!(body.data.days_activity.is_empty());
    }

    #[tokio::test]
    async fn responses_use_camel_case_keys() {
        let (state, _) = seeded().await;
        let Json(body) = info(State(state.clone())).await.unwrap();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], 200);
        assert_eq!(json["data"]["holdersCount"], 4);
        assert_eq!(json["data"]["latestBlock"]["height"], 2);
        assert!(json["data"]["daysActivity"].is_array());

        let Json(body) = holder(
            State(state),
            Path(format!("{:?}", addr(1))),
            Query(PageQuery::default()),
        )
        .await
        .unwrap();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["data"]["holder"]["incomingSum"], "0x3e8");
        assert_eq!(json["data"]["holder"]["balance"], "700");
        assert_eq!(json["data"]["transfers"]["total"], 3);
        assert!(json["data"]["transfers"]["items"][0]["blockHeight"].is_u64());
    }
}
