pub mod genotype;
pub mod snvmat;

pub mod prelude {
    pub use super::genotype::{
        ClassifierConfig, EmissionModel, FitScope, GenotypeCall, GenotypeCalls, GenotypeClass,
        GenotypeClassifier, SiteStatus,
    };
    pub use super::snvmat::{
        read_sites_from_tsv, AlleleChannel, AlleleMatrices, BuildConfig, BuildOutput, DedupMode,
        MatrixBuilder, RawRecord, VariantIndex,
    };
}
