use crate::equation_engine::{Compiler, EquationSystem};
use crate::error::ModelError;
use crate::generator::DerivedSystem;
use crate::parameters::{InitialValues, ParameterSet};
use crate::solvers::{Tsit5, RK4};
use crate::traits::{AdaptiveSteppable, DynamicalSystem, Steppable};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

const SAFETY: f64 = 0.9;
const MIN_SHRINK: f64 = 0.2;
const MAX_GROWTH: f64 = 5.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverKind {
    /// Adaptive Tsitouras 5(4).
    #[default]
    Tsit5,
    /// Fixed-step classic Runge-Kutta.
    Rk4,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    pub solver: SolverKind,
    pub rtol: f64,
    pub atol: f64,
    /// First trial step of the adaptive solver; estimated when absent.
    pub initial_step: Option<f64>,
    pub min_step: f64,
    /// Budget of attempted steps (accepted plus rejected).
    pub max_steps: usize,
    /// RK4 steps taken between consecutive samples.
    pub rk4_substeps: usize,
    /// Wall-clock limit. Leave unset on targets without a clock.
    pub timeout: Option<Duration>,
    /// Values below `-negative_tolerance` are reported as negative populations.
    pub negative_tolerance: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            solver: SolverKind::Tsit5,
            rtol: 1e-6,
            atol: 1e-9,
            initial_step: None,
            min_step: 1e-12,
            max_steps: 1_000_000,
            rk4_substeps: 10,
            timeout: None,
            negative_tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompartmentSeries {
    pub compartment: String,
    pub label: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SimulationWarning {
    NegativePopulation {
        compartment: String,
        first_time: f64,
        minimum: f64,
        samples: usize,
    },
}

impl fmt::Display for SimulationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationWarning::NegativePopulation {
                compartment,
                first_time,
                minimum,
                samples,
            } => write!(
                f,
                "Compartment '{compartment}' turns negative at t = {first_time} \
                 ({samples} sample(s), minimum {minimum})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub times: Vec<f64>,
    /// One series per compartment, in model order.
    pub series: Vec<CompartmentSeries>,
    pub parameters: ParameterSet,
    pub initial_values: InitialValues,
    pub stats: SolverStats,
    pub warnings: Vec<SimulationWarning>,
}

impl SimulationResult {
    pub fn samples(&self) -> usize {
        self.times.len()
    }

    pub fn series_for(&self, compartment: &str) -> Option<&CompartmentSeries> {
        self.series.iter().find(|s| s.compartment == compartment)
    }

    /// All compartment values at sample `index`, in model order.
    pub fn row(&self, index: usize) -> Option<Vec<f64>> {
        self.series
            .iter()
            .map(|s| s.values.get(index).copied())
            .collect()
    }

    pub fn final_state(&self) -> Vec<f64> {
        self.series
            .iter()
            .filter_map(|s| s.values.last().copied())
            .collect()
    }
}

struct Deadline {
    start: Instant,
    limit: Duration,
}

impl Deadline {
    fn check(deadline: &Option<Deadline>) -> Result<(), ModelError> {
        match deadline {
            Some(d) if d.start.elapsed() >= d.limit => Err(ModelError::TimedOut(d.limit)),
            _ => Ok(()),
        }
    }
}

/// `count` evenly spaced points from `t0` to `t1`, both included.
pub fn sample_times(t0: f64, t1: f64, count: usize) -> Vec<f64> {
    let last = count.saturating_sub(1).max(1) as f64;
    let mut times: Vec<f64> = (0..count)
        .map(|i| t0 + (t1 - t0) * (i as f64) / last)
        .collect();
    if let Some(end) = times.last_mut() {
        if count > 1 {
            *end = t1;
        }
    }
    times
}

/// Integrates the derived system over `time_span`, sampling `step_count`
/// evenly spaced points including both ends.
pub fn simulate(
    system: &DerivedSystem,
    parameters: &ParameterSet,
    initial_values: &InitialValues,
    time_span: (f64, f64),
    step_count: usize,
    settings: &SimulationSettings,
) -> Result<SimulationResult, ModelError> {
    let (t0, t1) = time_span;
    if !t0.is_finite() || !t1.is_finite() {
        return Err(ModelError::InvalidTimeSpan(format!(
            "bounds must be finite, got [{t0}, {t1}]"
        )));
    }
    if t1 <= t0 {
        return Err(ModelError::InvalidTimeSpan(format!(
            "end time {t1} must be after start time {t0}"
        )));
    }
    if step_count < 2 {
        return Err(ModelError::InvalidTimeSpan(format!(
            "at least 2 samples are required, got {step_count}"
        )));
    }
    if system.is_empty() {
        return Err(ModelError::EmptyModel);
    }

    let compartments = system.compartment_ids();
    for name in parameters.names() {
        if compartments.iter().any(|c| c == name) {
            warn!("Parameter '{name}' names a compartment; the state variable is used instead");
        }
    }

    let missing: Vec<String> = system
        .parameters
        .iter()
        .filter(|name| !parameters.contains(name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ModelError::UnboundParameter(missing));
    }

    let mut state = compartments
        .iter()
        .map(|id| {
            initial_values
                .get(id)
                .copied()
                .ok_or_else(|| ModelError::MissingInitialValue(id.clone()))
        })
        .collect::<Result<Vec<f64>, _>>()?;

    let param_values: Vec<f64> = system
        .parameters
        .iter()
        .filter_map(|name| parameters.get(name))
        .collect();
    let compiler = Compiler::new(&compartments, &system.parameters);
    let equations = system
        .equations
        .iter()
        .map(|e| {
            compiler
                .compile(&e.rhs)
                .map_err(|symbol| ModelError::UnboundParameter(vec![symbol]))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let vector_field = EquationSystem::new(equations, param_values);

    let times = sample_times(t0, t1, step_count);
    let mut samples: Vec<Vec<f64>> = state
        .iter()
        .map(|&v| {
            let mut values = Vec::with_capacity(step_count);
            values.push(v);
            values
        })
        .collect();

    let deadline = settings.timeout.map(|limit| Deadline {
        start: Instant::now(),
        limit,
    });
    debug!(
        "Simulating {} compartment(s) over [{t0}, {t1}] with {:?}",
        compartments.len(),
        settings.solver
    );
    let stats = match settings.solver {
        SolverKind::Tsit5 => integrate_adaptive(
            &vector_field,
            &times,
            &mut state,
            settings,
            &deadline,
            &mut samples,
        )?,
        SolverKind::Rk4 => integrate_fixed(
            &vector_field,
            &times,
            &mut state,
            settings,
            &deadline,
            &mut samples,
        )?,
    };

    let series: Vec<CompartmentSeries> = system
        .equations
        .iter()
        .zip(samples)
        .map(|(equation, values)| CompartmentSeries {
            compartment: equation.compartment.clone(),
            label: equation.label.clone(),
            values,
        })
        .collect();
    let warnings = negative_populations(&times, &series, settings.negative_tolerance);
    for warning in &warnings {
        warn!("{warning}");
    }
    info!(
        "Simulation finished: {} samples, {} accepted / {} rejected steps",
        times.len(),
        stats.accepted_steps,
        stats.rejected_steps
    );

    Ok(SimulationResult {
        times,
        series,
        parameters: parameters.clone(),
        initial_values: compartments
            .iter()
            .filter_map(|id| initial_values.get(id).map(|v| (id.clone(), *v)))
            .collect(),
        stats,
        warnings,
    })
}

fn record(samples: &mut [Vec<f64>], state: &[f64]) {
    for (series, value) in samples.iter_mut().zip(state) {
        series.push(*value);
    }
}

fn ensure_finite(state: &[f64], t: f64) -> Result<(), ModelError> {
    if state.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(ModelError::IntegrationFailed(format!(
            "state became non-finite at t = {t}"
        )))
    }
}

/// Weighted RMS norm of the local error estimate.
fn error_norm(error: &[f64], before: &[f64], after: &[f64], atol: f64, rtol: f64) -> f64 {
    let sum: f64 = error
        .iter()
        .zip(before.iter().zip(after))
        .map(|(e, (y0, y1))| {
            let scale = atol + rtol * y0.abs().max(y1.abs());
            (e / scale).powi(2)
        })
        .sum();
    (sum / error.len().max(1) as f64).sqrt()
}

fn rms(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v * v, n + 1));
    (sum / n.max(1) as f64).sqrt()
}

/// Starting step from the size of the state relative to its derivative.
fn initial_step(
    system: &impl DynamicalSystem<f64>,
    t0: f64,
    state: &[f64],
    span: f64,
    settings: &SimulationSettings,
) -> f64 {
    if let Some(step) = settings.initial_step {
        return step.min(span);
    }
    let mut derivative = vec![0.0; state.len()];
    system.apply(t0, state, &mut derivative);
    let scale = |y: f64| settings.atol + settings.rtol * y.abs();
    let d0 = rms(state.iter().map(|y| y / scale(*y)));
    let d1 = rms(derivative.iter().zip(state).map(|(f, y)| f / scale(*y)));
    let guess = if d0 < 1e-5 || d1 < 1e-5 || !d1.is_finite() {
        1e-6
    } else {
        0.01 * d0 / d1
    };
    guess.min(span)
}

fn integrate_adaptive(
    system: &EquationSystem<f64>,
    times: &[f64],
    state: &mut [f64],
    settings: &SimulationSettings,
    deadline: &Option<Deadline>,
    samples: &mut [Vec<f64>],
) -> Result<SolverStats, ModelError> {
    let dim = state.len();
    let mut solver: Tsit5<f64> = Tsit5::new(dim);
    let mut proposal = vec![0.0; dim];
    let mut error = vec![0.0; dim];
    let exponent = -1.0 / (solver.error_order() as f64 + 1.0);

    let t_start = times[0];
    let span = times[times.len() - 1] - t_start;
    let mut t = t_start;
    let mut dt = initial_step(system, t, state, span, settings);
    let mut stats = SolverStats::default();

    for &target in &times[1..] {
        while t < target {
            Deadline::check(deadline)?;
            if stats.accepted_steps + stats.rejected_steps >= settings.max_steps {
                return Err(ModelError::IntegrationFailed(format!(
                    "step budget of {} exhausted at t = {t}",
                    settings.max_steps
                )));
            }

            let remaining = target - t;
            let clipped = dt >= remaining;
            let h = if clipped { remaining } else { dt };
            solver.attempt(system, t, state, h, &mut proposal, &mut error);
            let norm = error_norm(&error, state, &proposal, settings.atol, settings.rtol);

            if norm <= 1.0 {
                state.copy_from_slice(&proposal);
                t = if clipped { target } else { t + h };
                ensure_finite(state, t)?;
                stats.accepted_steps += 1;
                let factor = if norm == 0.0 {
                    MAX_GROWTH
                } else {
                    (SAFETY * norm.powf(exponent)).clamp(MIN_SHRINK, MAX_GROWTH)
                };
                // A step shortened to land on a sample says nothing about dt.
                dt = if clipped { dt.max(h * factor) } else { h * factor };
            } else {
                stats.rejected_steps += 1;
                let factor = if norm.is_finite() {
                    (SAFETY * norm.powf(exponent)).clamp(MIN_SHRINK, 1.0)
                } else {
                    MIN_SHRINK
                };
                dt = h * factor;
                if dt < settings.min_step {
                    return Err(ModelError::IntegrationFailed(format!(
                        "step size underflow ({dt:e}) at t = {t}"
                    )));
                }
            }
        }
        record(samples, state);
    }
    Ok(stats)
}

fn integrate_fixed(
    system: &EquationSystem<f64>,
    times: &[f64],
    state: &mut [f64],
    settings: &SimulationSettings,
    deadline: &Option<Deadline>,
    samples: &mut [Vec<f64>],
) -> Result<SolverStats, ModelError> {
    let mut solver: RK4<f64> = RK4::new(state.len());
    let substeps = settings.rk4_substeps.max(1);
    let mut stats = SolverStats::default();

    for window in times.windows(2) {
        let h = (window[1] - window[0]) / substeps as f64;
        let mut t = window[0];
        for _ in 0..substeps {
            Deadline::check(deadline)?;
            solver.step(system, &mut t, state, h);
            stats.accepted_steps += 1;
        }
        ensure_finite(state, window[1])?;
        record(samples, state);
    }
    Ok(stats)
}

fn negative_populations(
    times: &[f64],
    series: &[CompartmentSeries],
    tolerance: f64,
) -> Vec<SimulationWarning> {
    series
        .iter()
        .filter_map(|s| {
            let first = s.values.iter().position(|v| *v < -tolerance)?;
            let minimum = s.values.iter().copied().fold(f64::INFINITY, f64::min);
            Some(SimulationWarning::NegativePopulation {
                compartment: s.compartment.clone(),
                first_time: times[first],
                minimum,
                samples: s.values.iter().filter(|v| **v < -tolerance).count(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::generate;
    use crate::model::{Endpoint, ModelGraph, VitalDynamics};

    fn sir_system(vital: VitalDynamics) -> DerivedSystem {
        let mut graph = ModelGraph::new();
        graph.add_compartment("S", "Susceptible", false).expect("S");
        graph.add_compartment("I", "Infected", true).expect("I");
        graph.add_compartment("R", "Recovered", false).expect("R");
        graph.declare_parameter("beta").expect("beta");
        graph.declare_parameter("gamma").expect("gamma");
        graph.add_infection_transition("S", "I", "beta*S*I").expect("infection");
        graph.add_transition("I", "R", "gamma*I").expect("recovery");
        graph.set_vital_dynamics(vital).expect("vital");
        generate(&graph).expect("generate")
    }

    fn sir_params() -> ParameterSet {
        ParameterSet::new().with("beta", 0.3).with("gamma", 0.1)
    }

    fn sir_initial() -> InitialValues {
        [("S", 0.99), ("I", 0.01), ("R", 0.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    fn decay_system(rate: &str) -> DerivedSystem {
        let mut graph = ModelGraph::new();
        graph.add_compartment("A", "Amount", false).expect("A");
        graph.declare_parameter("k").expect("k");
        graph.add_transition("A", Endpoint::Outside, rate).expect("outflow");
        generate(&graph).expect("generate")
    }

    fn amount(value: f64) -> InitialValues {
        std::iter::once(("A".to_string(), value)).collect()
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, ModelError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn sample_times_include_both_ends() {
        let times = sample_times(0.0, 1.0, 5);
        assert_eq!(times, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        let times = sample_times(0.0, 0.3, 4);
        assert_eq!(times.last(), Some(&0.3));
    }

    #[test]
    fn simulation_is_deterministic() {
        let system = sir_system(VitalDynamics::default());
        let settings = SimulationSettings::default();
        let first = simulate(&system, &sir_params(), &sir_initial(), (0.0, 160.0), 161, &settings)
            .expect("simulate");
        let second = simulate(&system, &sir_params(), &sir_initial(), (0.0, 160.0), 161, &settings)
            .expect("simulate");
        assert_eq!(first, second);
        assert_eq!(first.samples(), 161);
        assert_eq!(first.times[0], 0.0);
        assert_eq!(first.times[160], 160.0);
        assert_eq!(first.row(0), Some(vec![0.99, 0.01, 0.0]));
        assert!(first.warnings.is_empty());
    }

    #[test]
    fn closed_model_conserves_population() {
        let system = sir_system(VitalDynamics::default());
        for solver in [SolverKind::Tsit5, SolverKind::Rk4] {
            let settings = SimulationSettings {
                solver,
                ..SimulationSettings::default()
            };
            let result = simulate(&system, &sir_params(), &sir_initial(), (0.0, 100.0), 101, &settings)
                .expect("simulate");
            for i in 0..result.samples() {
                let total: f64 = result.row(i).expect("row").iter().sum();
                assert!((total - 1.0).abs() < 1e-6, "{solver:?} total {total} at sample {i}");
            }
        }
    }

    #[test]
    fn solvers_agree_on_an_epidemic_curve() {
        let system = sir_system(VitalDynamics::default());
        let tsit5 = simulate(
            &system,
            &sir_params(),
            &sir_initial(),
            (0.0, 100.0),
            11,
            &SimulationSettings::default(),
        )
        .expect("tsit5");
        let rk4 = simulate(
            &system,
            &sir_params(),
            &sir_initial(),
            (0.0, 100.0),
            11,
            &SimulationSettings {
                solver: SolverKind::Rk4,
                rk4_substeps: 100,
                ..SimulationSettings::default()
            },
        )
        .expect("rk4");
        for (a, b) in tsit5.final_state().iter().zip(rk4.final_state()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
        assert!(tsit5.stats.accepted_steps > 0);
        assert_eq!(rk4.stats.accepted_steps, 1000);
    }

    #[test]
    fn adaptive_solver_tracks_exponential_decay() {
        let system = decay_system("k*A");
        let params = ParameterSet::new().with("k", 0.7);
        let result = simulate(&system, &params, &amount(2.0), (0.0, 3.0), 7, &SimulationSettings::default())
            .expect("simulate");
        for (t, value) in result.times.iter().zip(&result.series[0].values) {
            let exact = 2.0 * (-0.7 * t).exp();
            assert!((value - exact).abs() < 1e-5, "t = {t}");
        }
        assert_eq!(result.series[0].label, "Amount");
    }

    #[test]
    fn inputs_are_validated() {
        let system = sir_system(VitalDynamics::default());
        let settings = SimulationSettings::default();
        let run = |params: &ParameterSet, initial: &InitialValues, span: (f64, f64), count: usize| {
            simulate(&system, params, initial, span, count, &settings)
        };

        assert_err_contains(
            run(&sir_params(), &sir_initial(), (1.0, 1.0), 10),
            "must be after start time",
        );
        assert_err_contains(
            run(&sir_params(), &sir_initial(), (0.0, f64::NAN), 10),
            "must be finite",
        );
        assert_err_contains(
            run(&sir_params(), &sir_initial(), (0.0, 1.0), 1),
            "at least 2 samples",
        );
        assert_eq!(
            run(&ParameterSet::new(), &sir_initial(), (0.0, 1.0), 10).unwrap_err(),
            ModelError::UnboundParameter(vec!["beta".into(), "gamma".into()])
        );

        let mut initial = sir_initial();
        initial.remove("R");
        assert_eq!(
            run(&sir_params(), &initial, (0.0, 1.0), 10).unwrap_err(),
            ModelError::MissingInitialValue("R".into())
        );
    }

    #[test]
    fn parameters_naming_compartments_are_ignored() {
        let system = sir_system(VitalDynamics::default());
        let params = sir_params().with("S", 1000.0);
        let result = simulate(
            &system,
            &params,
            &sir_initial(),
            (0.0, 10.0),
            3,
            &SimulationSettings::default(),
        )
        .expect("simulate");
        assert_eq!(result.row(0), Some(vec![0.99, 0.01, 0.0]));
        assert!(result.final_state()[0] < 0.99);
    }

    #[test]
    fn negative_populations_pass_through_with_a_warning() {
        let system = decay_system("k");
        let params = ParameterSet::new().with("k", 1.0);
        let result = simulate(&system, &params, &amount(1.0), (0.0, 2.0), 5, &SimulationSettings::default())
            .expect("simulate");
        assert!((result.final_state()[0] + 1.0).abs() < 1e-9);
        match result.warnings.as_slice() {
            [SimulationWarning::NegativePopulation {
                compartment,
                first_time,
                samples,
                ..
            }] => {
                assert_eq!(compartment, "A");
                assert_eq!(*first_time, 1.5);
                assert_eq!(*samples, 2);
            }
            other => panic!("unexpected warnings {other:?}"),
        }
    }

    #[test]
    fn budgets_and_timeouts_are_enforced() {
        let system = sir_system(VitalDynamics::default());
        let tight = SimulationSettings {
            max_steps: 3,
            rtol: 1e-12,
            ..SimulationSettings::default()
        };
        assert!(matches!(
            simulate(&system, &sir_params(), &sir_initial(), (0.0, 100.0), 2, &tight),
            Err(ModelError::IntegrationFailed(_))
        ));

        let instant = SimulationSettings {
            timeout: Some(Duration::ZERO),
            ..SimulationSettings::default()
        };
        assert_eq!(
            simulate(&system, &sir_params(), &sir_initial(), (0.0, 100.0), 2, &instant).unwrap_err(),
            ModelError::TimedOut(Duration::ZERO)
        );
    }
}
