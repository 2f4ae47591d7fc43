use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng};

use adcodegen::{
    Arg, Graph,
    codegen::{ModelCodegen, Settings, Sources},
    emit::TextEmitter,
    jobs::GroupStrategy,
    loops::{LoopModel, NoLoopModel},
    tape::{ExprTape, Tape, TapeBuilder},
};

/// Generates loop-compressed derivative sources for a demo model
///
/// For `it` in `0..N`, with `a = x[it + 1]`, `b = x[it + 2]`, `c = x[0]`
/// and `z = x[N + 2]²`, the model computes
/// `a * b + sin(a) * c * z`, `exp(b) * c` and (except on the last
/// iteration) `a * a * c`, plus `x[0] + sin(x[N + 2])` outside of the loop.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    cmd: Command,

    /// Number of loop iterations
    #[clap(short = 'N', long, default_value_t = NonZeroUsize::new(4).unwrap())]
    iterations: NonZeroUsize,

    /// Model name, used as a prefix for every function
    #[clap(short, long, default_value = "demo")]
    name: String,

    /// Disable temporary variable recycling
    #[clap(long)]
    no_reuse: bool,

    /// Number of threads to use
    #[clap(short, long)]
    threads: Option<NonZeroUsize>,

    /// Group short jobs together once their durations are known
    #[clap(long)]
    grouped: bool,

    /// Check the generated graphs against the model without loops
    #[clap(long)]
    check: bool,

    /// Directory in which to write one file per function
    #[clap(short, long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Full sparse Jacobian
    Jacobian,
    /// Full sparse Hessian, as second-order reverse mode row functions
    Hessian,
    /// Both of the above
    All,
}

////////////////////////////////////////////////////////////////////////////////

struct Model {
    n: usize,
}

impl Model {
    fn domain(&self) -> usize {
        self.n + 3
    }

    fn range(&self) -> usize {
        3 * self.n
    }

    fn loop_model(&self) -> Result<LoopModel<f64>> {
        let n = self.n;
        let mut t = TapeBuilder::<f64>::new();
        let v = t.inputs(4);
        let (a, b, c, z) = (v[0], v[1], v[2], v[3]);
        let ab = t.mul(a, b);
        let s = t.sin(a);
        let sc = t.mul(s, c);
        let scz = t.mul(sc, z);
        let g0 = t.add(ab, scz);
        let e = t.exp(b);
        let g1 = t.mul(e, c);
        let aa = t.mul(a, a);
        let g2 = t.mul(aa, c);
        let tape: Arc<dyn Tape<f64>> = Arc::new(t.finish(vec![g0, g1, g2])?);

        let dependents = vec![
            (0..n).map(Some).collect(),
            (n..2 * n).map(Some).collect(),
            (0..n)
                .map(|it| (it + 1 < n).then_some(2 * n + it))
                .collect(),
        ];
        Ok(LoopModel::new(
            0,
            tape,
            n,
            dependents,
            vec![(1..=n).collect(), (2..n + 2).collect()],
            vec![0],
            vec![0],
        )?)
    }

    fn no_loop_model(&self) -> Result<NoLoopModel<f64>> {
        let mut t = TapeBuilder::<f64>::new();
        let x = t.inputs(self.domain());
        let last = x[self.n + 2];
        let s = t.sin(last);
        let y = t.add(x[0], s);
        let z = t.mul(last, last);
        let tape: Arc<dyn Tape<f64>> = Arc::new(t.finish(vec![y, z])?);
        Ok(NoLoopModel::new(tape, vec![3 * self.n - 1])?)
    }

    /// The same equations, without loops
    fn flat(&self) -> Result<ExprTape<f64>> {
        let n = self.n;
        let mut t = TapeBuilder::<f64>::new();
        let x = t.inputs(self.domain());
        let last = x[n + 2];
        let z = t.mul(last, last);
        let mut outputs = vec![];
        let (mut g1, mut g2) = (vec![], vec![]);
        for it in 0..n {
            let (a, b, c) = (x[it + 1], x[it + 2], x[0]);
            let ab = t.mul(a, b);
            let s = t.sin(a);
            let sc = t.mul(s, c);
            let scz = t.mul(sc, z);
            outputs.push(t.add(ab, scz));
            let e = t.exp(b);
            g1.push(t.mul(e, c));
            if it + 1 < n {
                let aa = t.mul(a, a);
                g2.push(t.mul(aa, c));
            }
        }
        let s = t.sin(last);
        let y = t.add(x[0], s);
        outputs.extend(g1);
        outputs.extend(g2);
        outputs.push(y);
        Ok(t.finish(outputs)?)
    }
}

fn inputs(g: &mut Graph<f64>, n: usize) -> Vec<Arg<f64>> {
    g.independents(n).into_iter().map(Arg::Node).collect()
}

fn compare(label: &str, actual: &[f64], expected: &[f64]) -> Result<()> {
    if actual.len() != expected.len() {
        bail!(
            "{label}: {} values, expected {}",
            actual.len(),
            expected.len()
        );
    }
    let err = actual
        .iter()
        .zip(expected)
        .map(|(a, b)| (a - b).abs() / b.abs().max(1.0))
        .fold(0.0, f64::max);
    if err > 1e-9 {
        bail!("{label}: relative error {err:e}");
    }
    info!("{label}: {} values match (max error {err:e})", actual.len());
    Ok(())
}

fn check_jacobian(
    codegen: &ModelCodegen<f64>,
    flat: &ExprTape<f64>,
    rows: &[usize],
    cols: &[usize],
    x: &[f64],
) -> Result<()> {
    let jac = codegen.sparse_jacobian(rows, cols)?;
    let actual = jac.evaluate(x)?;

    let mut g = Graph::<f64>::new();
    let xs = inputs(&mut g, flat.domain());
    let elements: Vec<_> = rows.iter().copied().zip(cols.iter().copied()).collect();
    let expected = flat
        .sparse_jacobian(&mut g, &xs, &elements)?
        .into_iter()
        .map(|v| g.eval(v, x))
        .collect::<Result<Vec<_>, _>>()?;
    compare("jacobian", &actual, &expected)
}

fn check_hessian(
    codegen: &ModelCodegen<f64>,
    flat: &ExprTape<f64>,
    elements: &BTreeMap<usize, Vec<usize>>,
    x: &[f64],
    py: &[f64],
) -> Result<()> {
    let r2 = codegen.sparse_reverse_two(elements)?;
    let mut args = x.to_vec();
    args.push(1.0);
    args.extend_from_slice(py);
    let actual = r2.evaluate(&args)?;

    let mut g = Graph::<f64>::new();
    let xs = inputs(&mut g, flat.domain());
    let w: Vec<Arg<f64>> = py.iter().map(|p| Arg::Const(*p)).collect();
    let pairs: Vec<_> = elements
        .iter()
        .flat_map(|(r, cs)| cs.iter().map(move |c| (*r, *c)))
        .collect();
    let expected = flat
        .sparse_hessian(&mut g, &xs, &w, &pairs)?
        .into_iter()
        .map(|v| g.eval(v, x))
        .collect::<Result<Vec<_>, _>>()?;
    compare("hessian", &actual, &expected)
}

fn write_sources(sources: &Sources, out: &Option<PathBuf>) -> Result<()> {
    match out {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            for (name, src) in &sources.functions {
                std::fs::write(dir.join(format!("{name}.txt")), src)?;
            }
            info!("wrote {} files to {dir:?}", sources.functions.len());
        }
        None => {
            for src in sources.functions.values() {
                println!("{src}");
            }
        }
    }
    if !sources.atomic_functions.is_empty() {
        info!("atomic functions: {:?}", sources.atomic_functions);
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();
    let args = Args::parse();

    let model = Model {
        n: args.iterations.get(),
    };
    if model.n < 2 {
        bail!("the demo model needs at least two iterations");
    }
    let settings = Settings {
        name: args.name.clone(),
        reuse_ids: !args.no_reuse,
    };
    let mut codegen = ModelCodegen::new(
        settings,
        model.domain(),
        model.range(),
        vec![model.loop_model()?],
        Some(model.no_loop_model()?),
    )?;

    #[cfg(feature = "parallel")]
    if let Some(n) = args.threads {
        codegen.jobs_mut().set_threads(n.get())?;
    }
    if args.grouped {
        codegen.jobs_mut().set_strategy(GroupStrategy::MultiHalfTime);
    }
    #[cfg(not(feature = "parallel"))]
    if args.threads.is_some_and(|n| n.get() > 1) {
        log::warn!("built without the `parallel` feature; running serially");
    }

    let flat = model.flat()?;
    let (rows, cols): (Vec<usize>, Vec<usize>) = flat
        .jacobian_sparsity()
        .into_iter()
        .enumerate()
        .flat_map(|(i, cs)| cs.into_iter().map(move |j| (i, j)))
        .unzip();
    let all_rows = (0..flat.range()).collect();
    let elements: BTreeMap<usize, Vec<usize>> = flat
        .hessian_sparsity(&all_rows)
        .into_iter()
        .enumerate()
        .filter(|(_, cs)| !cs.is_empty())
        .map(|(j, cs)| (j, cs.into_iter().collect()))
        .collect();

    let mut rng = StdRng::seed_from_u64(0);
    let x: Vec<f64> = (0..model.domain()).map(|_| rng.gen_range(0.5..1.5)).collect();
    let py: Vec<f64> = (0..model.range()).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let (jacobian, hessian) = match args.cmd {
        Command::Jacobian => (true, false),
        Command::Hessian => (false, true),
        Command::All => (true, true),
    };
    let emitter = TextEmitter::new().with_inlining(true);
    if jacobian {
        let start = Instant::now();
        let sources = codegen.jacobian_sources(&rows, &cols, &emitter)?;
        info!("generated jacobian sources in {:?}", start.elapsed());
        write_sources(&sources, &args.out)?;
        if args.check {
            check_jacobian(&codegen, &flat, &rows, &cols, &x)?;
        }
    }
    if hessian {
        let start = Instant::now();
        let sources = codegen.reverse_two_sources(&elements, &emitter)?;
        info!("generated hessian sources in {:?}", start.elapsed());
        write_sources(&sources, &args.out)?;
        if args.check {
            check_hessian(&codegen, &flat, &elements, &x, &py)?;
        }
    }
    Ok(())
}
