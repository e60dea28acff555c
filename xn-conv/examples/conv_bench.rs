use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::{Rng, SeedableRng};
use xn_conv::layout::{BlockedData, BlockedWeights};
use xn_conv::{
    ConvDesc, ConvKind, ConvTuning, ConvolutionBwdData, ConvolutionBwdWeights, ConvolutionFwd,
    JobConfig, MemoryCostStrategy, RefBwdDataKernel, RefBwdWeightsKernel, RefFwdKernel,
    RefTranspose,
};

fn random(len: usize) -> Vec<f32> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(299792458);
    (0..len).map(|_| rng.random_range(-1f32..1f32)).collect()
}

fn desc(with_bias: bool) -> ConvDesc {
    ConvDesc {
        mb: 8,
        ic: 64,
        oc: 72,
        ih: 28,
        iw: 28,
        kh: 3,
        kw: 3,
        padding: [0, 1, 1],
        with_bias,
        ..Default::default()
    }
}

trait Benchmark: Sized {
    fn preprocess(nthr: usize) -> Result<Self>;
    fn run_one(&mut self) -> Result<()>;

    const ITERS: usize;
}

struct Fwd {
    conv: ConvolutionFwd<f32, f32, f32, RefFwdKernel>,
    src: Vec<f32>,
    weights: Vec<f32>,
    bias: Vec<f32>,
    dst: Vec<f32>,
}

impl Benchmark for Fwd {
    fn preprocess(nthr: usize) -> Result<Self> {
        let tuning = ConvTuning { mb_block: 2, oc_buffs: 1, ..Default::default() };
        let conf = JobConfig::new(ConvKind::ForwardPlain, &desc(true), tuning)?;
        let src = random(BlockedData::src(&conf).elem_count());
        let weights = random(BlockedWeights::new(&conf).elem_count());
        let bias = random(conf.oc_without_padding);
        let dst = vec![0f32; BlockedData::dst(&conf).elem_count()];
        let conv = ConvolutionFwd::new(conf, RefFwdKernel, nthr)?;
        Ok(Self { conv, src, weights, bias, dst })
    }

    fn run_one(&mut self) -> Result<()> {
        self.conv.execute(&self.src, &self.weights, Some(self.bias.as_slice()), &mut self.dst)?;
        Ok(())
    }

    const ITERS: usize = 5;
}

struct BwdData {
    conv: ConvolutionBwdData<f32, f32, f32, RefBwdDataKernel>,
    diff_dst: Vec<f32>,
    weights: Vec<f32>,
    diff_src: Vec<f32>,
}

impl Benchmark for BwdData {
    fn preprocess(nthr: usize) -> Result<Self> {
        let tuning = ConvTuning { ic_buffs: 2, ..Default::default() };
        let conf = JobConfig::new(ConvKind::BackwardData, &desc(false), tuning)?;
        let diff_dst = random(BlockedData::dst(&conf).elem_count());
        let weights = random(BlockedWeights::new(&conf).elem_count());
        let diff_src = vec![0f32; BlockedData::src(&conf).elem_count()];
        let conv = ConvolutionBwdData::new(conf, RefBwdDataKernel, nthr)?;
        Ok(Self { conv, diff_dst, weights, diff_src })
    }

    fn run_one(&mut self) -> Result<()> {
        self.conv.execute(&self.diff_dst, &self.weights, &mut self.diff_src)?;
        Ok(())
    }

    const ITERS: usize = 5;
}

struct BwdWeights {
    conv: ConvolutionBwdWeights<f32, f32, f32, RefBwdWeightsKernel, RefTranspose>,
    src: Vec<f32>,
    diff_dst: Vec<f32>,
    diff_weights: Vec<f32>,
    diff_bias: Vec<f32>,
}

impl Benchmark for BwdWeights {
    fn preprocess(nthr: usize) -> Result<Self> {
        let conf = JobConfig::new(ConvKind::BackwardWeights, &desc(true), ConvTuning::default())?;
        let src = random(BlockedData::src(&conf).elem_count());
        let diff_dst = random(BlockedData::dst(&conf).elem_count());
        let diff_weights = vec![0f32; BlockedWeights::new(&conf).elem_count()];
        let diff_bias = vec![0f32; conf.oc_without_padding];
        let conv = ConvolutionBwdWeights::new(
            conf,
            RefBwdWeightsKernel,
            RefTranspose,
            nthr,
            &MemoryCostStrategy,
        )?;
        println!("grid {}", conv.grid());
        Ok(Self { conv, src, diff_dst, diff_weights, diff_bias })
    }

    fn run_one(&mut self) -> Result<()> {
        let diff_bias = Some(self.diff_bias.as_mut_slice());
        self.conv.execute(&self.src, &self.diff_dst, &mut self.diff_weights, diff_bias)?;
        Ok(())
    }

    const ITERS: usize = 5;
}

fn run<B: Benchmark>(iters: Option<usize>, nthr: usize) -> Result<()> {
    use std::hint::black_box;

    let iters = iters.unwrap_or(B::ITERS);
    let mut d = B::preprocess(nthr)?;
    let start = std::time::Instant::now();
    for _iter in 0..iters {
        black_box(black_box(&mut d).run_one()?);
    }
    println!("{:?}", start.elapsed() / iters as u32);
    Ok(())
}

fn init_tracing() -> tracing_chrome::FlushGuard {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::{prelude::*, registry::Registry};

    let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
    Registry::default().with(chrome_layer).init();
    guard
}

#[derive(Subcommand, Debug, Clone)]
enum Task {
    Fwd,
    BwdData,
    BwdWeights,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// The benchmark to be run.
    #[command(subcommand)]
    task: Task,

    #[arg(long)]
    iters: Option<usize>,

    /// Worker threads, defaults to half of the hardware threads.
    #[arg(long)]
    nthr: Option<usize>,

    #[arg(long)]
    chrome_tracing: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = if args.chrome_tracing { Some(init_tracing()) } else { None };
    let nthr = args.nthr.unwrap_or_else(xn_conv::default_parallelism);
    println!("avx512: {}, nthr: {nthr}", xn_conv::with_avx512());
    match args.task {
        Task::Fwd => run::<Fwd>(args.iters, nthr)?,
        Task::BwdData => run::<BwdData>(args.iters, nthr)?,
        Task::BwdWeights => run::<BwdWeights>(args.iters, nthr)?,
    }
    Ok(())
}
