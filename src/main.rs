use adaptive_mcmc::chain::{Chain, ChainConfig};
use adaptive_mcmc::multichain::{MultiChain, MultiChainConfig};
use adaptive_mcmc::proposal::{Proposal, RandomWalkKernel, ScaleKernel};
use adaptive_mcmc::schedule::{OperatorSchedule, SubScheduleSpec};
use std::time::Duration;

fn posterior(state: &[f64]) -> f64 {
    // standard bivariate normal
    -0.5 * state.iter().map(|x| x * x).sum::<f64>()
}

fn build_schedule() -> Result<OperatorSchedule, adaptive_mcmc::error::Error> {
    let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(2_000);
    schedule.add_proposal(Proposal::new("sigmaScaler", 1.0, ScaleKernel::new(0.5))?);
    schedule.add_proposal(Proposal::new("meanWalker", 3.0, RandomWalkKernel::new(0.5))?);
    schedule.add_subschedule(
        SubScheduleSpec::percentage(20.0)
            .with_proposal(Proposal::new("boldWalker", 1.0, RandomWalkKernel::new(2.0))?),
    )?;
    Ok(schedule)
}

fn main() -> Result<(), adaptive_mcmc::error::Error> {
    // a single tuned chain with a progress bar
    let mut chain = Chain::new(
        posterior as fn(&[f64]) -> f64,
        build_schedule()?,
        &[1.0, -1.0],
        ChainConfig::new(50_000),
    )?
    .set_seed(42);
    chain.run_with_progress()?;
    let mut table = Vec::new();
    chain.schedule_mut().show_rates(&mut table)?;
    println!("{}", String::from_utf8_lossy(&table));

    // a coupled run with live convergence reporting
    let template = std::env::temp_dir().join("adaptive-mcmc-$(seed).log");
    let config = MultiChainConfig::new(template.to_string_lossy().into_owned())
        .with_n_chains(2)
        .with_base_seed(42)
        .with_poll_interval(Duration::from_millis(250));
    let mut multi = MultiChain::new(config, |_, _| {
        Chain::new(
            posterior as fn(&[f64]) -> f64,
            build_schedule()?,
            &[1.0, -1.0],
            ChainConfig::new(20_000).with_log_every(500),
        )
    })?;
    let reports = multi.run()?;
    println!("{} convergence reports emitted", reports.len());
    Ok(())
}
