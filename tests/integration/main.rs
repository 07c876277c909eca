//! Integration tests: the engine driven through its public API.

mod mock_sink;
mod scenario;
mod simulation;
