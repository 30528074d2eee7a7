use std::sync::Arc;

use picshare_storage::Storage;

use crate::auth::AuthKeys;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Storage>,
    pub auth: AuthKeys,
}
