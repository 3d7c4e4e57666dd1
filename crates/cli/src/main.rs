use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use binary_glmm_core::data::DataFrame;
use binary_glmm_core::diagnostics::wald_tests;
use binary_glmm_core::glmm::{load_model_json, save_model_json, FittedModel};
use binary_glmm_core::predict::{PredictionScale, SimulationScale};
use binary_glmm_core::{
    CancellationToken, GlmmBuilder, GroupingSpec, OptimizerMethod, PredictOptions,
    SimulateOptions, UnseenLevelPolicy,
};

#[derive(Parser)]
#[command(name = "glmm")]
#[command(version)]
#[command(about = "Multilevel logistic regression via PIRLS and the Laplace approximation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Method {
    Bfgs,
    NelderMead,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scale {
    Link,
    Response,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a binary random-intercept model
    Fit {
        /// Path to data CSV file
        #[arg(short, long)]
        data: PathBuf,

        /// Binary response column (0/1 or true/false)
        #[arg(short, long)]
        response: String,

        /// Fixed-effect terms (e.g. "age + sex + ward_type"); intercept by default
        #[arg(short, long, default_value = "1")]
        fixed: String,

        /// Grouping factor (repeatable): NAME, or NAME=COL[:COL..] to read the
        /// labels from other columns (several columns form an interaction key)
        #[arg(short, long, required = true)]
        group: Vec<String>,

        /// Declare a factor nested within another: CHILD:PARENT (repeatable)
        #[arg(long)]
        nest: Vec<String>,

        /// Declare a factor crossed with the others (repeatable)
        #[arg(long)]
        crossed: Vec<String>,

        #[arg(long, value_enum, default_value = "bfgs")]
        method: Method,

        /// Maximum number of outer iterations
        #[arg(long, default_value = "200")]
        max_iter: usize,

        /// Maximum number of PIRLS iterations per evaluation
        #[arg(long, default_value = "50")]
        max_inner_iter: usize,

        /// Convergence tolerance of the outer optimizer
        #[arg(long, default_value = "1e-6")]
        tolerance: f64,

        /// Wall-clock budget for the outer loop, in seconds
        #[arg(long)]
        time_budget: Option<f64>,

        /// Reject unseen levels at prediction time instead of using zero
        #[arg(long)]
        reject_unseen: bool,

        /// Save the fitted model as JSON
        #[arg(long)]
        save: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Predict probabilities (or linear predictors) for new rows
    Predict {
        /// Fitted model JSON written by `fit --save`
        #[arg(short, long)]
        model: PathBuf,

        /// Path to CSV with the covariate and grouping columns
        #[arg(short, long)]
        data: PathBuf,

        #[arg(long, value_enum, default_value = "response")]
        scale: Scale,

        /// Ignore the fitted random effects (typical-group prediction)
        #[arg(long)]
        no_random_effects: bool,

        /// Fail on levels absent from the fit data
        #[arg(long)]
        reject_unseen: bool,
    },

    /// Simulate outcomes for new rows
    Simulate {
        #[arg(short, long)]
        model: PathBuf,

        #[arg(short, long)]
        data: PathBuf,

        #[arg(long, default_value = "1000")]
        draws: usize,

        #[arg(long, default_value = "42")]
        seed: u64,

        /// Draw every level from N(0, variance) instead of starting from
        /// the fitted conditional modes
        #[arg(long)]
        no_random_effects: bool,

        /// Draw existing levels around their modes with the conditional variance
        #[arg(long)]
        conditional_uncertainty: bool,

        /// Return probabilities instead of 0/1 outcomes
        #[arg(long)]
        probabilities: bool,

        #[arg(long)]
        reject_unseen: bool,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Fit {
            data,
            response,
            fixed,
            group,
            nest,
            crossed,
            method,
            max_iter,
            max_inner_iter,
            tolerance,
            time_budget,
            reject_unseen,
            save,
            format,
        } => {
            let groups = grouping_specs(&group, &nest, &crossed)?;
            let df = load_data(&data)?;

            let mut builder = GlmmBuilder::new()
                .data(&df)
                .response(&response)
                .fixed(&fixed)
                .max_iterations(max_iter)
                .max_inner_iterations(max_inner_iter)
                .convergence(tolerance)
                .method(match method {
                    Method::Bfgs => OptimizerMethod::Bfgs,
                    Method::NelderMead => OptimizerMethod::NelderMead,
                })
                .unseen_level_policy(policy(reject_unseen));
            if let Some(secs) = time_budget {
                builder = builder.time_budget(Duration::from_secs_f64(secs));
            }
            for spec in groups {
                builder = builder.group(spec);
            }

            let problem = builder.build().context("Failed to build binary GLMM")?;
            eprintln!(
                "Model: {} fixed params, {} grouping factors, {} levels, method={}",
                problem.n_fixed(),
                problem.n_factors(),
                problem.n_random(),
                problem.config.method
            );

            let model = problem.fit().context("Fitting failed")?;

            if let Some(path) = save {
                save_model_json(&model, &path)
                    .with_context(|| format!("Failed to save model to '{}'", path.display()))?;
                log::info!("Saved model to '{}'", path.display());
            }

            match format {
                Format::Json => print_json(&model)?,
                Format::Text => println!("{}", model.summary()),
            }
            Ok(())
        }
        Commands::Predict {
            model,
            data,
            scale,
            no_random_effects,
            reject_unseen,
        } => {
            let model = load_model(&model)?;
            let df = load_data(&data)?;
            let options = PredictOptions {
                scale: match scale {
                    Scale::Link => PredictionScale::Link,
                    Scale::Response => PredictionScale::Response,
                },
                use_fitted_random_effects: !no_random_effects,
                unseen_level_policy: Some(policy(reject_unseen)),
            };
            let prediction =
                binary_glmm_core::predict(&model, &df, &options).context("Prediction failed")?;
            for u in prediction.unseen.iter().filter(|u| u.rows > 0) {
                eprintln!(
                    "Note: {} rows reference {} unseen '{}' levels",
                    u.rows, u.levels, u.factor
                );
            }
            println!(
                "row,{}",
                match scale {
                    Scale::Link => "eta",
                    Scale::Response => "probability",
                }
            );
            for (i, v) in prediction.values.iter().enumerate() {
                println!("{},{}", i + 1, v);
            }
            Ok(())
        }
        Commands::Simulate {
            model,
            data,
            draws,
            seed,
            no_random_effects,
            conditional_uncertainty,
            probabilities,
            reject_unseen,
            format,
        } => {
            if conditional_uncertainty && no_random_effects {
                bail!("--conditional-uncertainty cannot be combined with --no-random-effects");
            }
            let model = load_model(&model)?;
            let df = load_data(&data)?;
            let options = SimulateOptions {
                n_draws: draws,
                use_fitted_random_effects: !no_random_effects,
                conditional_uncertainty,
                scale: if probabilities {
                    SimulationScale::Probability
                } else {
                    SimulationScale::Outcome
                },
                seed,
                unseen_level_policy: Some(policy(reject_unseen)),
            };
            let sim = binary_glmm_core::simulate(&model, &df, &options, &CancellationToken::new())
                .context("Simulation failed")?;

            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&sim)?),
                Format::Text => {
                    println!("row,mean");
                    for (i, m) in sim.means.iter().enumerate() {
                        println!("{},{}", i + 1, m);
                    }
                }
            }
            Ok(())
        }
    }
}

fn policy(reject: bool) -> UnseenLevelPolicy {
    if reject {
        UnseenLevelPolicy::Reject
    } else {
        UnseenLevelPolicy::Zero
    }
}

fn load_data(path: &PathBuf) -> Result<DataFrame> {
    let df = DataFrame::from_csv(path)
        .with_context(|| format!("Failed to load data from '{}'", path.display()))?;
    eprintln!(
        "Loaded {} observations, {} columns from '{}'",
        df.nrows(),
        df.ncols(),
        path.display()
    );
    Ok(df)
}

fn load_model(path: &PathBuf) -> Result<FittedModel> {
    load_model_json(path)
        .with_context(|| format!("Failed to load model from '{}'", path.display()))
}

/// Grouping declarations from `--group`, `--nest CHILD:PARENT` and `--crossed`.
fn grouping_specs(groups: &[String], nest: &[String], crossed: &[String]) -> Result<Vec<GroupingSpec>> {
    let mut specs = Vec::with_capacity(groups.len());
    for decl in groups {
        let spec = match decl.split_once('=') {
            None => GroupingSpec::new(decl.trim()),
            Some((name, columns)) => {
                let columns: Vec<&str> = columns.split(':').map(str::trim).collect();
                if columns.iter().any(|c| c.is_empty()) {
                    bail!("Invalid --group '{}': expected NAME=COL[:COL..]", decl);
                }
                GroupingSpec::interaction(name.trim(), &columns)
            }
        };
        specs.push(spec);
    }

    for decl in nest {
        let Some((child, parent)) = decl.split_once(':') else {
            bail!("Invalid --nest '{}': expected CHILD:PARENT", decl);
        };
        let (child, parent) = (child.trim(), parent.trim());
        let Some(spec) = specs.iter_mut().find(|s| s.name == child) else {
            bail!("--nest refers to '{}', which is not a --group", child);
        };
        *spec = spec.clone().within(parent);
    }
    for name in crossed {
        let Some(spec) = specs.iter_mut().find(|s| &s.name == name) else {
            bail!("--crossed refers to '{}', which is not a --group", name);
        };
        *spec = spec.clone().crossed();
    }
    Ok(specs)
}

fn print_json(model: &FittedModel) -> Result<()> {
    let mut map = serde_json::Map::new();

    map.insert("status".to_string(), serde_json::json!(format!("{:?}", model.status)));
    map.insert(
        "outer_iterations".to_string(),
        serde_json::json!(model.outer_iterations),
    );
    map.insert(
        "log_likelihood".to_string(),
        serde_json::json!(model.log_likelihood),
    );
    map.insert("aic".to_string(), serde_json::json!(model.aic()));
    map.insert("bic".to_string(), serde_json::json!(model.bic()));
    map.insert("n_obs".to_string(), serde_json::json!(model.n_obs));
    map.insert("singular".to_string(), serde_json::json!(model.is_singular()));

    let icc = model.icc();
    let vc: Vec<serde_json::Value> = model
        .variance_components
        .iter()
        .zip(&icc.entries)
        .map(|(v, e)| {
            serde_json::json!({
                "factor": v.factor,
                "parent": v.parent,
                "variance": v.variance,
                "std_dev": v.std_dev,
                "std_dev_se": v.std_dev_se,
                "icc": e.icc,
                "cumulative_icc": e.cumulative_icc,
                "median_odds_ratio": e.median_odds_ratio,
            })
        })
        .collect();
    map.insert("variance_components".to_string(), serde_json::json!(vc));
    map.insert(
        "residual_share".to_string(),
        serde_json::json!(icc.residual_share),
    );

    let fe: Vec<serde_json::Value> = model
        .fixed_effects
        .iter()
        .map(|e| {
            serde_json::json!({
                "term": e.term,
                "level": e.level,
                "estimate": e.estimate,
                "se": e.se,
                "z": e.z,
                "p_value": e.p_value,
            })
        })
        .collect();
    map.insert("fixed_effects".to_string(), serde_json::json!(fe));
    map.insert(
        "wald_tests".to_string(),
        serde_json::to_value(wald_tests(model))?,
    );

    let warnings: Vec<String> = model.warnings.iter().map(|w| w.to_string()).collect();
    map.insert("warnings".to_string(), serde_json::json!(warnings));

    let json_str = serde_json::to_string_pretty(&serde_json::Value::Object(map))?;
    println!("{}", json_str);
    Ok(())
}
