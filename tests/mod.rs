mod common;

mod idempotency_tests;
mod redis_store_tests;
mod retry_tests;
