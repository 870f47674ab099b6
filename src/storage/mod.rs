pub mod model_store;

pub use model_store::{
    default_label, next_id, sanitize_label, validate_user, ModelRecord, ModelStore, StoreLock,
    MAX_LABEL_LEN,
};
