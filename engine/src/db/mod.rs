// Database layer backing the PostgreSQL user directory

pub mod pool;

pub use pool::DbPool;
