use crate::{
    db::{self, DbPool},
    entities::{client, product, site},
    errors::ServiceError,
    services::sequence::{SequenceAllocator, SequenceKind},
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateProductInput {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateClientInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(max = 32))]
    pub tax_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateSiteInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub client_id: Uuid,
    pub sub_client_id: Option<Uuid>,
    #[validate(length(max = 500))]
    pub address: Option<String>,
}

/// Site together with the client that owns it, composed at read time.
#[derive(Debug, Clone, Serialize)]
pub struct SiteWithClient {
    pub site: site::Model,
    pub client: client::Model,
}

/// Product catalog and client/site registry consumed by the deposit lifecycle.
#[derive(Clone)]
pub struct DirectoryService {
    db_pool: Arc<DbPool>,
}

impl DirectoryService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self))]
    pub async fn create_product(
        &self,
        input: CreateProductInput,
    ) -> Result<product::Model, ServiceError> {
        input.validate()?;
        if input.unit_price.is_sign_negative() {
            return Err(ServiceError::ValidationError(
                "unit price cannot be negative".to_string(),
            ));
        }
        if input.unit_price > crate::entities::deposit::MAX_AMOUNT {
            return Err(ServiceError::ValidationError(
                "unit price is out of range".to_string(),
            ));
        }

        let result = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(input.code.trim().to_uppercase()),
            name: Set(input.name),
            unit_price: Set(input.unit_price),
            ..Default::default()
        }
        .insert(self.db_pool.as_ref())
        .await;

        match result {
            Ok(model) => {
                info!(product_id = %model.id, code = %model.code, "product created");
                Ok(model)
            }
            Err(e) if db::is_unique_violation(&e) => Err(ServiceError::Conflict(format!(
                "product code {} already exists",
                input.code
            ))),
            Err(e) => Err(ServiceError::db_error(e)),
        }
    }

    pub async fn get_product(&self, id: Uuid) -> Result<product::Model, ServiceError> {
        Self::product_in(self.db_pool.as_ref(), id).await
    }

    pub(crate) async fn product_in<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
    ) -> Result<product::Model, ServiceError> {
        product::Entity::find_by_id(id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Product", id))
    }

    #[instrument(skip(self))]
    pub async fn create_client(
        &self,
        input: CreateClientInput,
    ) -> Result<client::Model, ServiceError> {
        input.validate()?;
        self.insert_client(input, None).await
    }

    /// Creates a sub-client under `parent_id`. Sub-clients cannot nest.
    #[instrument(skip(self))]
    pub async fn create_sub_client(
        &self,
        parent_id: Uuid,
        input: CreateClientInput,
    ) -> Result<client::Model, ServiceError> {
        input.validate()?;
        let parent = self.get_client(parent_id).await?;
        if parent.is_sub_client() {
            return Err(ServiceError::ValidationError(format!(
                "{} is itself a sub-client and cannot own sub-clients",
                parent.code
            )));
        }
        self.insert_client(input, Some(parent.id)).await
    }

    async fn insert_client(
        &self,
        input: CreateClientInput,
        parent_id: Option<Uuid>,
    ) -> Result<client::Model, ServiceError> {
        let kind = if parent_id.is_some() {
            SequenceKind::SubClient
        } else {
            SequenceKind::Client
        };

        let model = db::transaction(&self.db_pool, "client.create", move |txn| {
            Box::pin(async move {
                let code = SequenceAllocator::next_in(txn, &kind.prefix()).await?;
                client::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    code: Set(code),
                    name: Set(input.name),
                    tax_id: Set(input.tax_id.map(|t| t.trim().to_uppercase())),
                    parent_id: Set(parent_id),
                    ..Default::default()
                }
                .insert(txn)
                .await
                .map_err(ServiceError::db_error)
            })
        })
        .await?;

        info!(client_id = %model.id, code = %model.code, "client created");
        Ok(model)
    }

    pub async fn get_client(&self, id: Uuid) -> Result<client::Model, ServiceError> {
        client::Entity::find_by_id(id)
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Client", id))
    }

    #[instrument(skip(self))]
    pub async fn create_site(&self, input: CreateSiteInput) -> Result<site::Model, ServiceError> {
        input.validate()?;

        let client = self.get_client(input.client_id).await?;
        if !client.active {
            return Err(ServiceError::ValidationError(format!(
                "client {} is not active",
                client.code
            )));
        }
        if let Some(sub_client_id) = input.sub_client_id {
            let sub_client = self.get_client(sub_client_id).await?;
            if sub_client.parent_id != Some(client.id) {
                return Err(ServiceError::ValidationError(format!(
                    "{} is not a sub-client of {}",
                    sub_client.code, client.code
                )));
            }
        }

        let model = db::transaction(&self.db_pool, "site.create", move |txn| {
            Box::pin(async move {
                let code = SequenceAllocator::next_in(txn, &SequenceKind::Site.prefix()).await?;
                site::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    code: Set(code),
                    name: Set(input.name),
                    client_id: Set(input.client_id),
                    sub_client_id: Set(input.sub_client_id),
                    address: Set(input.address),
                    ..Default::default()
                }
                .insert(txn)
                .await
                .map_err(ServiceError::db_error)
            })
        })
        .await?;

        info!(site_id = %model.id, code = %model.code, "site created");
        Ok(model)
    }

    pub async fn get_site(&self, id: Uuid) -> Result<site::Model, ServiceError> {
        Self::site_in(self.db_pool.as_ref(), id).await
    }

    pub(crate) async fn site_in<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
    ) -> Result<site::Model, ServiceError> {
        site::Entity::find_by_id(id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Site", id))
    }

    /// Resolves the client that owns a site. Deposits never store the client.
    pub async fn client_for_site(&self, site_id: Uuid) -> Result<SiteWithClient, ServiceError> {
        let (site, client) = site::Entity::find_by_id(site_id)
            .find_also_related(client::Entity)
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Site", site_id))?;

        let client = client.ok_or_else(|| {
            ServiceError::InternalError(format!("site {} has no owning client", site.code))
        })?;

        Ok(SiteWithClient { site, client })
    }
}
