pub mod layout;
pub mod serializer;
pub mod change_log;
