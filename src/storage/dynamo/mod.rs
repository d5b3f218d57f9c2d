//! DynamoDB store implementation.
//!
//! Typed [`Condition`]s and [`UpdateAction`]s are rendered to expression
//! strings with placeholder names (`#n0`) and values (`:v0`). Transaction
//! cancellation reasons are mapped back to the index of the failed write.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, Delete, DeleteRequest, GlobalSecondaryIndex,
    KeySchemaElement, KeyType, Projection, ProjectionType, Put, PutRequest, ReturnValue,
    ScalarAttributeType, TransactWriteItem, Update, WriteRequest,
};
use aws_sdk_dynamodb::Client;
use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{debug, info, warn};

use super::{
    Condition, Item, Key, Page, PageToken, PreparedWrite, Query, Result, SortCondition, Store,
    StoreError, TableSchema, UpdateAction,
};

mod convert;
mod expr;

pub use convert::{from_dynamo_item, from_dynamo_value, to_dynamo_item, to_dynamo_value};
use expr::Expr;

/// DynamoDB caps batch writes at 25 requests.
pub const MAX_BATCH_WRITE: usize = 25;

/// Items DynamoDB accepts in one TransactWriteItems call.
pub const MAX_TRANSACT_ITEMS: usize = 100;

type DynamoItem = HashMap<String, AttributeValue>;

/// DynamoDB implementation of one table.
pub struct DynamoStore {
    client: Client,
    table_name: String,
    schema: TableSchema,
    backoff: ExponentialBuilder,
}

impl DynamoStore {
    /// Connect using the default AWS configuration chain.
    pub async fn connect(
        table_name: impl Into<String>,
        schema: TableSchema,
        endpoint_url: Option<&str>,
    ) -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        let client = if let Some(endpoint) = endpoint_url {
            let dynamo_config = aws_sdk_dynamodb::config::Builder::from(&config)
                .endpoint_url(endpoint)
                .build();
            Client::from_conf(dynamo_config)
        } else {
            Client::new(&config)
        };

        let table_name = table_name.into();
        info!(table = %table_name, "Connected to DynamoDB");

        Ok(Self::from_client(client, table_name, schema))
    }

    pub fn from_client(client: Client, table_name: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            schema,
            backoff: unprocessed_backoff(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Create the table with its indexes if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<()> {
        let definitions = self
            .schema
            .key_attributes()
            .into_iter()
            .map(|name| {
                AttributeDefinition::builder()
                    .attribute_name(name)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(build_error)
            })
            .collect::<Result<Vec<_>>>()?;

        let indexes = self
            .schema
            .indexes
            .iter()
            .map(|index| {
                GlobalSecondaryIndex::builder()
                    .index_name(&index.name)
                    .set_key_schema(Some(key_schema(&index.partition_key, &index.sort_key)?))
                    .projection(
                        Projection::builder()
                            .projection_type(ProjectionType::All)
                            .build(),
                    )
                    .build()
                    .map_err(build_error)
            })
            .collect::<Result<Vec<_>>>()?;

        let result = self
            .client
            .create_table()
            .table_name(&self.table_name)
            .set_attribute_definitions(Some(definitions))
            .set_key_schema(Some(key_schema(
                &self.schema.partition_key,
                &self.schema.sort_key,
            )?))
            .set_global_secondary_indexes((!indexes.is_empty()).then_some(indexes))
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(table = %self.table_name, "Created DynamoDB table");
                Ok(())
            }
            Err(e) if e.code() == Some("ResourceInUseException") => {
                debug!(table = %self.table_name, "DynamoDB table already exists");
                Ok(())
            }
            Err(e) => Err(map_sdk_error(e)),
        }
    }

    fn dynamo_key(&self, key: &Key) -> DynamoItem {
        to_dynamo_item(self.schema.key_item(key))
    }

    fn key_of(&self, item: &Item) -> Result<Key> {
        self.schema.key_of(item).ok_or_else(|| {
            StoreError::Validation(format!(
                "item is missing string key attributes `{}`/`{}`",
                self.schema.partition_key, self.schema.sort_key
            ))
        })
    }

    fn condition_failed(key: &Key) -> StoreError {
        StoreError::ConditionFailed {
            partition: key.partition.clone(),
            sort: key.sort.clone(),
        }
    }

    fn transact_item(&self, write: PreparedWrite) -> Result<TransactWriteItem> {
        let mut expr = Expr::new(&self.schema);
        let item = match write {
            PreparedWrite::Put { item, condition } => {
                let condition = condition.map(|c| expr.condition(&c));
                TransactWriteItem::builder()
                    .put(
                        Put::builder()
                            .table_name(&self.table_name)
                            .set_item(Some(to_dynamo_item(item)))
                            .set_condition_expression(condition)
                            .set_expression_attribute_names(expr.names())
                            .set_expression_attribute_values(expr.values())
                            .build()
                            .map_err(build_error)?,
                    )
                    .build()
            }
            PreparedWrite::Update {
                key,
                actions,
                condition,
            } => {
                let update = expr.update(&actions);
                let condition = condition.map(|c| expr.condition(&c));
                TransactWriteItem::builder()
                    .update(
                        Update::builder()
                            .table_name(&self.table_name)
                            .set_key(Some(self.dynamo_key(&key)))
                            .update_expression(update)
                            .set_condition_expression(condition)
                            .set_expression_attribute_names(expr.names())
                            .set_expression_attribute_values(expr.values())
                            .build()
                            .map_err(build_error)?,
                    )
                    .build()
            }
            PreparedWrite::Delete { key, condition } => {
                let condition = condition.map(|c| expr.condition(&c));
                TransactWriteItem::builder()
                    .delete(
                        Delete::builder()
                            .table_name(&self.table_name)
                            .set_key(Some(self.dynamo_key(&key)))
                            .set_condition_expression(condition)
                            .set_expression_attribute_names(expr.names())
                            .set_expression_attribute_values(expr.values())
                            .build()
                            .map_err(build_error)?,
                    )
                    .build()
            }
        };
        Ok(item)
    }

    /// Submit write requests in store-sized chunks, re-submitting unprocessed
    /// requests with exponential backoff.
    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<()> {
        let mut requests = requests;
        while !requests.is_empty() {
            let chunk: Vec<WriteRequest> = requests
                .drain(..requests.len().min(MAX_BATCH_WRITE))
                .collect();
            self.batch_write_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn batch_write_chunk(&self, chunk: Vec<WriteRequest>) -> Result<()> {
        let mut pending = chunk;
        let mut delays = self.backoff.clone().build();
        loop {
            let output = self
                .client
                .batch_write_item()
                .request_items(&self.table_name, pending)
                .send()
                .await
                .map_err(map_sdk_error)?;

            pending = output
                .unprocessed_items
                .and_then(|mut unprocessed| unprocessed.remove(&self.table_name))
                .unwrap_or_default();
            if pending.is_empty() {
                return Ok(());
            }

            match delays.next() {
                Some(delay) => {
                    debug!(
                        table = %self.table_name,
                        unprocessed = pending.len(),
                        ?delay,
                        "Retrying unprocessed batch writes"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        table = %self.table_name,
                        unprocessed = pending.len(),
                        "Giving up on unprocessed batch writes"
                    );
                    return Err(StoreError::Throttled(format!(
                        "{} batch writes left unprocessed",
                        pending.len()
                    )));
                }
            }
        }
    }
}

/// Backoff for re-submitting unprocessed batch writes.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 8
/// - Jitter enabled
fn unprocessed_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(8)
        .with_jitter()
}

fn key_schema(partition_key: &str, sort_key: &str) -> Result<Vec<KeySchemaElement>> {
    [(partition_key, KeyType::Hash), (sort_key, KeyType::Range)]
        .into_iter()
        .map(|(name, key_type)| {
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(build_error)
        })
        .collect()
}

fn build_error(e: aws_sdk_dynamodb::error::BuildError) -> StoreError {
    StoreError::Validation(format!("invalid DynamoDB request: {}", e))
}

/// Classify an SDK error into semantic and infrastructure failures.
fn map_sdk_error<E, R>(err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{}", aws_sdk_dynamodb::error::DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) => StoreError::Unavailable(message),
        SdkError::DispatchFailure(_) => StoreError::Unavailable(message),
        _ => match err.code() {
            Some(
                "ProvisionedThroughputExceededException"
                | "ThrottlingException"
                | "RequestLimitExceeded"
                | "TransactionInProgressException",
            ) => StoreError::Throttled(message),
            Some("InternalServerError" | "ServiceUnavailable") => {
                StoreError::Unavailable(message)
            }
            Some("ValidationException") => StoreError::Validation(message),
            _ => StoreError::Backend(message),
        },
    }
}

fn is_conditional_check_failed<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(err, SdkError::ServiceError(_))
        && err.code() == Some("ConditionalCheckFailedException")
}

fn build_key_condition(expr: &mut Expr, query: &Query, pk_attr: &str, sk_attr: &str) -> String {
    let pk = format!("{} = {}", expr.name(pk_attr), expr.value(query.partition.clone().into()));
    match &query.sort {
        None => pk,
        Some(SortCondition::Equals(sort)) => format!(
            "{} AND {} = {}",
            pk,
            expr.name(sk_attr),
            expr.value(sort.clone().into())
        ),
        Some(SortCondition::BeginsWith(prefix)) => format!(
            "{} AND begins_with({}, {})",
            pk,
            expr.name(sk_attr),
            expr.value(prefix.clone().into())
        ),
    }
}

#[async_trait]
impl Store for DynamoStore {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn get(&self, key: &Key, consistent: bool) -> Result<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(self.dynamo_key(key)))
            .consistent_read(consistent)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(output.item.map(from_dynamo_item))
    }

    async fn put(&self, item: Item, condition: Option<Condition>) -> Result<()> {
        let key = self.key_of(&item)?;
        let mut expr = Expr::new(&self.schema);
        let condition = condition.map(|c| expr.condition(&c));
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_dynamo_item(item)))
            .set_condition_expression(condition)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_conditional_check_failed(&e) => Err(Self::condition_failed(&key)),
            Err(e) => Err(map_sdk_error(e)),
        }
    }

    async fn update(
        &self,
        key: &Key,
        actions: Vec<UpdateAction>,
        condition: Option<Condition>,
    ) -> Result<Item> {
        let mut expr = Expr::new(&self.schema);
        let update = expr.update(&actions);
        let condition = condition.map(|c| expr.condition(&c));
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(self.dynamo_key(key)))
            .update_expression(update)
            .set_condition_expression(condition)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .return_values(ReturnValue::AllNew)
            .send()
            .await;
        match result {
            Ok(output) => Ok(output.attributes.map(from_dynamo_item).unwrap_or_default()),
            Err(e) if is_conditional_check_failed(&e) => Err(Self::condition_failed(key)),
            Err(e) => Err(map_sdk_error(e)),
        }
    }

    async fn delete(&self, key: &Key, condition: Option<Condition>) -> Result<Option<Item>> {
        let mut expr = Expr::new(&self.schema);
        let condition = condition.map(|c| expr.condition(&c));
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(self.dynamo_key(key)))
            .set_condition_expression(condition)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .return_values(ReturnValue::AllOld)
            .send()
            .await;
        match result {
            Ok(output) => Ok(output.attributes.map(from_dynamo_item)),
            Err(e) if is_conditional_check_failed(&e) => Err(Self::condition_failed(key)),
            Err(e) => Err(map_sdk_error(e)),
        }
    }

    async fn transact_write(&self, writes: Vec<PreparedWrite>) -> Result<()> {
        if writes.len() > MAX_TRANSACT_ITEMS {
            return Err(StoreError::TooManyItems {
                count: writes.len(),
                max: MAX_TRANSACT_ITEMS,
            });
        }
        let items = writes
            .into_iter()
            .map(|write| self.transact_item(write))
            .collect::<Result<Vec<_>>>()?;

        let result = self
            .client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await;

        let err = match result {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };

        if let SdkError::ServiceError(service_err) = &err {
            if let TransactWriteItemsError::TransactionCanceledException(canceled) =
                service_err.err()
            {
                let codes: Vec<Option<&str>> = canceled
                    .cancellation_reasons()
                    .iter()
                    .map(|reason| reason.code())
                    .collect();
                if let Some(index) = codes
                    .iter()
                    .position(|code| *code == Some("ConditionalCheckFailed"))
                {
                    return Err(StoreError::TransactionCanceled { index: Some(index) });
                }
                if codes.iter().any(|code| {
                    matches!(
                        code,
                        Some("TransactionConflict" | "ThrottlingError" | "ProvisionedThroughputExceeded")
                    )
                }) {
                    return Err(StoreError::Throttled(format!(
                        "transaction canceled: {:?}",
                        codes
                    )));
                }
                return Err(StoreError::TransactionCanceled { index: None });
            }
        }
        Err(map_sdk_error(err))
    }

    async fn batch_put(&self, items: Vec<Item>) -> Result<()> {
        let requests = items
            .into_iter()
            .map(|item| {
                Ok(WriteRequest::builder()
                    .put_request(
                        PutRequest::builder()
                            .set_item(Some(to_dynamo_item(item)))
                            .build()
                            .map_err(build_error)?,
                    )
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;
        self.batch_write(requests).await
    }

    async fn batch_delete(&self, keys: Vec<Key>) -> Result<()> {
        let requests = keys
            .iter()
            .map(|key| {
                Ok(WriteRequest::builder()
                    .delete_request(
                        DeleteRequest::builder()
                            .set_key(Some(self.dynamo_key(key)))
                            .build()
                            .map_err(build_error)?,
                    )
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;
        self.batch_write(requests).await
    }

    async fn query_page(&self, query: &Query, start: Option<PageToken>) -> Result<Page> {
        let (pk_attr, sk_attr) = match &query.index {
            None => (
                self.schema.partition_key.as_str(),
                self.schema.sort_key.as_str(),
            ),
            Some(name) => {
                let index = self.schema.index(name).ok_or_else(|| {
                    StoreError::Validation(format!("table has no index `{}`", name))
                })?;
                (index.partition_key.as_str(), index.sort_key.as_str())
            }
        };

        let mut expr = Expr::new(&self.schema);
        let key_condition = build_key_condition(&mut expr, query, pk_attr, sk_attr);
        let projection = query.projection.as_ref().map(|attrs| {
            attrs
                .iter()
                .map(|attr| expr.name(attr))
                .collect::<Vec<_>>()
                .join(", ")
        });

        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .set_index_name(query.index.clone())
            .key_condition_expression(key_condition)
            .set_projection_expression(projection)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .scan_index_forward(query.forward)
            .set_limit(query.limit.map(|l| l.min(i32::MAX as usize) as i32))
            .set_exclusive_start_key(start.map(|PageToken(token)| to_dynamo_item(token)))
            .send()
            .await
            .map_err(map_sdk_error)?;

        let items = output
            .items
            .unwrap_or_default()
            .into_iter()
            .map(from_dynamo_item)
            .collect();
        let next = output
            .last_evaluated_key
            .filter(|key| !key.is_empty())
            .map(|key| PageToken(from_dynamo_item(key)));
        Ok(Page { items, next })
    }
}
