mod bench;
mod compat;
mod manifest;
mod refresh;
mod run;
mod seed;
mod smoke;
mod snapshot;

pub use run::run;
