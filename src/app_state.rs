use std::sync::Arc;

use sqlx::{Pool, Postgres};

use crate::engine::Producer;
use crate::store::JobStore;

#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<Producer>,
    pub store: Arc<dyn JobStore>,
    pub db_pool: Pool<Postgres>,
}
