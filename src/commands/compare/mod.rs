mod facts;
mod report;
mod rules;
mod run;

pub use run::run;
