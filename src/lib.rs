pub mod cobertura;
pub mod error;
pub mod jacoco;
pub mod measures;
pub mod resolve;
