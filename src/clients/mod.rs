pub mod bus;
pub mod circuit_breaker;
pub mod database;
pub mod email;
pub mod fcm;
pub mod health;
pub mod lookup;
pub mod provider;
pub mod rbmq;
pub mod redis;
pub mod store;
pub mod template;
pub mod user;
