pub mod cancel;
pub mod edit_lock;
