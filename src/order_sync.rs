//! Sales order import.
//!
//! Pages through Bling's sales orders on behalf of a tenant. Every page goes
//! through the [`IntegrationFacade`]; when the integration is disconnected or
//! unreachable the sync is reported as pending instead of failing the batch.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::IntegrationError;
use crate::facade::{CallError, IntegrationFacade};
use crate::providers::BlingProvider;
use crate::providers::bling::SalesOrder;

/// Orders requested per page.
pub const PAGE_LIMIT: u32 = 100;
/// Pages fetched per sync before stopping.
pub const MAX_PAGES: u32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed { orders: Vec<SalesOrder>, pages: u32 },
    /// Nothing was imported; retry once the integration is usable again.
    Pending { reason: String },
}

#[derive(Clone)]
pub struct OrderSync {
    facade: IntegrationFacade,
    client: Arc<BlingProvider>,
}

impl OrderSync {
    pub fn new(facade: IntegrationFacade, client: Arc<BlingProvider>) -> Self {
        Self { facade, client }
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn sync_orders(
        &self,
        tenant_id: Uuid,
        since: Option<NaiveDate>,
    ) -> Result<SyncOutcome, IntegrationError> {
        let mut orders = Vec::new();
        let mut pages = 0;

        while pages < MAX_PAGES {
            let page = pages + 1;
            let client = self.client.clone();
            let fetched = self
                .facade
                .with_valid_token(tenant_id, move |session| {
                    let client = client.clone();
                    async move {
                        client
                            .list_sales_orders(
                                &session.api_base,
                                &session.access_token,
                                page,
                                PAGE_LIMIT,
                                since,
                            )
                            .await
                            .map_err(CallError::from)
                    }
                })
                .await;

            let batch = match fetched {
                Ok(batch) => batch,
                Err(err) if defers_sync(&err) => {
                    warn!(error = %err, page, "Order sync deferred");
                    return Ok(SyncOutcome::Pending {
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            };

            pages = page;
            let last_page = (batch.len() as u32) < PAGE_LIMIT;
            orders.extend(batch);
            if last_page {
                break;
            }
        }

        if pages == MAX_PAGES {
            warn!(max_pages = MAX_PAGES, "Order sync stopped at page cap");
        }
        info!(orders = orders.len(), pages, "Order sync completed");
        Ok(SyncOutcome::Completed { orders, pages })
    }
}

/// Failures that leave the batch pending rather than failed.
fn defers_sync(err: &IntegrationError) -> bool {
    err.is_transient()
        || matches!(
            err,
            IntegrationError::TokenExpired | IntegrationError::AuthorizationError(_)
        )
}
