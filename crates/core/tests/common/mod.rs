//! Synthetic multilevel binary data shared by the integration tests.

use binary_glmm_core::data::DataFrame;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

pub const HOSPITALS: usize = 6;
pub const WARDS_PER_HOSPITAL: usize = 4;
pub const PATIENTS_PER_WARD: usize = 15;

/// Patients in wards in hospitals. Ward labels `W1..W4` repeat in every
/// hospital, so the ward factor must be declared nested.
///
/// logit P(y = 1) = -0.5 + 0.7 age + u_hospital + u_ward,
/// u_hospital ~ N(0, 0.8²), u_ward ~ N(0, 0.5²).
pub fn hospital_data(seed: u64) -> DataFrame {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut y = Vec::new();
    let mut age = Vec::new();
    let mut hospital = Vec::new();
    let mut ward = Vec::new();

    for h in 0..HOSPITALS {
        let u_h: f64 = 0.8 * rng.sample::<f64, _>(StandardNormal);
        for w in 0..WARDS_PER_HOSPITAL {
            let u_w: f64 = 0.5 * rng.sample::<f64, _>(StandardNormal);
            for _ in 0..PATIENTS_PER_WARD {
                let a: f64 = rng.sample(StandardNormal);
                let eta = -0.5 + 0.7 * a + u_h + u_w;
                let p = 1.0 / (1.0 + (-eta).exp());
                y.push(if rng.gen::<f64>() < p { 1 } else { 0 });
                age.push(a);
                hospital.push(format!("H{}", h + 1));
                ward.push(format!("W{}", w + 1));
            }
        }
    }

    let hospital: Vec<&str> = hospital.iter().map(String::as_str).collect();
    let ward: Vec<&str> = ward.iter().map(String::as_str).collect();
    let mut df = DataFrame::new();
    df.add_integer_column("y", y).unwrap();
    df.add_float_column("age", age).unwrap();
    df.add_factor_column("hospital", &hospital).unwrap();
    df.add_factor_column("ward", &ward).unwrap();
    df
}

/// Request rows of (hospital, ward, age).
pub fn request(rows: &[(&str, &str, f64)]) -> DataFrame {
    let hospital: Vec<&str> = rows.iter().map(|r| r.0).collect();
    let ward: Vec<&str> = rows.iter().map(|r| r.1).collect();
    let mut df = DataFrame::new();
    df.add_float_column("age", rows.iter().map(|r| r.2).collect())
        .unwrap();
    df.add_factor_column("hospital", &hospital).unwrap();
    df.add_factor_column("ward", &ward).unwrap();
    df
}
