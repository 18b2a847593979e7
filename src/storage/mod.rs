pub mod mysql;

pub use mysql::MySqlStorage;
