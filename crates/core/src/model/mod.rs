mod builder;
mod design;
mod spec;

pub use builder::{GlmmBuilder, GlmmProblem};
pub use design::{
    build_combined_random_design, build_fixed_design, build_random_design, build_response,
    check_full_rank, numerical_rank, DesignSchema, EncodedTerm, FixedEffectLabel,
};
pub use spec::{parse_fixed_formula, FixedTerm, ModelSpec};
