pub mod gtf;

pub use gtf::FeatureStruct;
