use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use symfield::{parse_source, CompileOptions, Expr, Lexer, Vector, VectorField};

#[derive(Parser)]
#[command(name = "symfield")]
#[command(about = "Symbolic vector fields: compile, evaluate, differentiate", long_about = None)]
#[command(version)]
struct Cli {
    /// Log compilation details (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy)]
struct CompileArgs {
    /// Compile expressions as written, without simplification
    #[arg(long = "no-optimize")]
    no_optimize: bool,

    /// Keep structurally equal subexpressions as separate nodes
    #[arg(long = "no-dedup")]
    no_dedup: bool,
}

impl CompileArgs {
    fn options(self) -> CompileOptions {
        CompileOptions::default()
            .with_optimize(!self.no_optimize)
            .with_deduplicate(!self.no_dedup)
    }
}

#[derive(Args)]
struct FieldArgs {
    /// Input field-definition file
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Field to use when the file defines several
    #[arg(short, long, value_name = "NAME")]
    field: Option<String>,

    /// Point to evaluate at, e.g. x=1,y=2
    #[arg(long, value_name = "POINT", value_parser = parse_point)]
    at: Option<Vector>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    compile: CompileArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Check syntax without compiling
    Check {
        /// Input field-definition file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print tokens from lexer
        #[arg(short, long)]
        tokens: bool,
    },

    /// Print the compiled expressions and evaluation layers of a field
    Show(FieldArgs),

    /// Evaluate a field at a point (requires --at)
    Eval(FieldArgs),

    /// Print the Jacobian of a field, or its values with --at
    Jacobian(FieldArgs),

    /// Print the divergence of a field, or its value with --at
    Divergence(FieldArgs),

    /// Run the built-in example field
    Demo,

    /// Display version info
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    match cli.command {
        Commands::Check { file, tokens } => check_file(file, tokens)?,
        Commands::Show(args) => {
            let field = load_field(&args)?;
            print!("{}", field);
            println!();
            print!("{}", field.program());
        }
        Commands::Eval(args) => {
            let at = args.at.as_ref().ok_or_else(|| anyhow!("eval needs a point, pass --at x=1,y=2"))?;
            let field = load_field(&args)?;
            report(&field, Some(at), args.json)?;
        }
        Commands::Jacobian(args) => {
            let field = load_field(&args)?;
            report(field.jacobian()?, args.at.as_ref(), args.json)?;
        }
        Commands::Divergence(args) => {
            let field = load_field(&args)?;
            report(field.divergence()?, args.at.as_ref(), args.json)?;
        }
        Commands::Demo => run_demo()?,
        Commands::Version => {
            println!("symfield v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// Parses `x=1,y=2` into a vector.
fn parse_point(text: &str) -> Result<Vector, String> {
    let mut point = Vector::new();
    for pair in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (axis, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected axis=value, got '{}'", pair))?;
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| format!("'{}' is not a number", value.trim()))?;
        point.insert(axis.trim(), value);
    }
    Ok(point)
}

fn check_file(file: PathBuf, print_tokens: bool) -> anyhow::Result<()> {
    println!("Checking: {}", file.display());
    let source = fs::read_to_string(&file).with_context(|| format!("cannot read {}", file.display()))?;

    if print_tokens {
        let tokens = Lexer::new(&source).tokenize()?;
        for (idx, token) in tokens.iter().enumerate() {
            println!("{:3}: {} @ {}:{}", idx, token.token_type, token.line, token.column);
        }
    }

    let parsed = parse_source(&source)?;
    for field in &parsed.fields {
        println!(
            "  field {}({}) -> {}",
            field.name,
            field.inputs.join(", "),
            field.outputs.iter().map(|d| d.axis.as_str()).collect::<Vec<_>>().join(", ")
        );
    }
    println!("Syntax check: OK");
    Ok(())
}

fn load_field(args: &FieldArgs) -> anyhow::Result<VectorField> {
    let source = fs::read_to_string(&args.file).with_context(|| format!("cannot read {}", args.file.display()))?;
    let parsed = parse_source(&source)?;

    let def = match (&args.field, parsed.fields.as_slice()) {
        (Some(name), _) => parsed
            .field(name)
            .ok_or_else(|| anyhow!("{} defines no field named '{}'", args.file.display(), name))?,
        (None, [only]) => only,
        (None, []) => bail!("{} defines no fields", args.file.display()),
        (None, many) => bail!(
            "{} defines several fields ({}), pick one with --field",
            args.file.display(),
            many.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join(", ")
        ),
    };
    Ok(def.build(args.compile.options())?)
}

/// Prints the field's functions, or its values at `at`.
fn report(field: &VectorField, at: Option<&Vector>, json: bool) -> anyhow::Result<()> {
    match (at, json) {
        (Some(point), true) => {
            let values = field.call(point)?;
            println!("{}", serde_json::to_string_pretty(&values.into_inner())?);
        }
        (Some(point), false) => print!("{}", field.call(point)?),
        (None, true) => {
            let functions: BTreeMap<&str, String> = field
                .output_axes()
                .iter()
                .filter_map(|axis| field.expression(axis).map(|e| (axis.as_str(), e.to_string())))
                .collect();
            println!("{}", serde_json::to_string_pretty(&functions)?);
        }
        (None, false) => print!("{}", field),
    }
    Ok(())
}

fn run_demo() -> anyhow::Result<()> {
    println!("symfield demo: F(x, y) = (10xy + y, -x - 1)");
    println!("============================================\n");

    let field = VectorField::new(["x", "y"], |a| {
        let (x, y): (&Expr, &Expr) = (&a["x"], &a["y"]);
        [("u", 10.0 * x * y + y), ("v", -x - 1.0)]
    })?;
    print!("{}", field);

    let point = Vector::new().with("x", 1.0).with("y", 2.0);
    println!("\nF at (x=1, y=2):");
    print!("{}", field.call(&point)?);

    let jacobian = field.jacobian()?;
    println!("\nJacobian:");
    print!("{}", jacobian);
    println!("\nJacobian at (x=1, y=2):");
    print!("{}", jacobian.call(&point)?);

    println!("\nEvaluation layers:");
    print!("{}", field.program());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        let p = parse_point("x=1, y = -2.5").unwrap();
        assert_eq!(p.get("x"), 1.0);
        assert_eq!(p.get("y"), -2.5);
        assert!(parse_point("x").is_err());
        assert!(parse_point("x=abc").is_err());
        assert!(parse_point("").unwrap().is_empty());
    }

    #[test]
    fn test_compile_args_map_to_options() {
        let args = CompileArgs {
            no_optimize: true,
            no_dedup: false,
        };
        assert_eq!(args.options(), CompileOptions::default().with_optimize(false));
    }
}
