//! Basic reproductive number by the next-generation-matrix method.
//!
//! Infected compartments are linearized at the disease-free equilibrium.
//! The Jacobian of new-infection terms `F` and of all other transfer terms
//! `V` give `K = F V^-1`, whose spectral radius is R0.

use crate::equilibrium::{disease_free_equilibrium, DiseaseFreeEquilibrium, NewtonSettings};
use crate::error::ModelError;
use crate::generator::DerivedSystem;
use crate::model::Compartment;
use crate::parameters::ParameterSet;
use crate::symbolic::{invert_matrix, matrix_product, Expr};
use log::{debug, info};
use nalgebra::DMatrix;
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Coordinates of the equilibrium may dip this far below zero from round-off.
const NEGATIVE_TOLERANCE: f64 = 1e-9;
/// Relative determinant below which a bound `V` counts as singular.
const SINGULAR_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct R0Result {
    pub formula: Expr,
    pub plaintext: String,
    pub latex: String,
    /// Present whenever the formula evaluates with the given parameters and
    /// the current values of free equilibrium coordinates.
    pub value: Option<f64>,
    /// True when `formula` is a closed-form spectral radius of a symbolic
    /// next-generation matrix.
    pub is_exact: bool,
    pub infected: Vec<String>,
    pub disease_free_equilibrium: DiseaseFreeEquilibrium,
    pub next_generation_matrix: Vec<Vec<Expr>>,
    /// Eigenvalues of the bound next-generation matrix, empty when unbound.
    pub eigenvalues: Vec<Complex<f64>>,
}

pub fn compute_r0(
    system: &DerivedSystem,
    compartments: &[Compartment],
    parameters: Option<&ParameterSet>,
) -> Result<R0Result, ModelError> {
    compute_r0_with(system, compartments, parameters, NewtonSettings::default())
}

/// [`compute_r0`] with explicit settings for the numeric equilibrium search.
pub fn compute_r0_with(
    system: &DerivedSystem,
    compartments: &[Compartment],
    parameters: Option<&ParameterSet>,
    settings: NewtonSettings,
) -> Result<R0Result, ModelError> {
    let lookup_compartment = |id: &str| compartments.iter().find(|c| c.id == id);
    for compartment in compartments {
        if system.equation(&compartment.id).is_none() {
            return Err(ModelError::UnknownCompartment(compartment.id.clone()));
        }
    }

    let mut infected = Vec::new();
    let mut uninfected = Vec::new();
    for id in system.compartment_ids() {
        let compartment =
            lookup_compartment(&id).ok_or_else(|| ModelError::UnknownCompartment(id.clone()))?;
        if compartment.is_infectious {
            infected.push(id);
        } else {
            uninfected.push(id);
        }
    }
    if infected.is_empty() {
        return Err(ModelError::NoInfectedCompartments);
    }

    let guess: Vec<f64> = uninfected
        .iter()
        .filter_map(|id| lookup_compartment(id).map(|c| c.value))
        .collect();
    let dfe =
        disease_free_equilibrium(system, &infected, &uninfected, parameters, &guess, settings)?;

    // Numeric bindings: parameters, plus free equilibrium coordinates at
    // their current values.
    let mut bindings: HashMap<String, f64> = parameters
        .map(|p| p.iter().map(|(k, v)| (k.to_string(), v)).collect())
        .unwrap_or_default();
    for id in &dfe.free {
        if let Some(compartment) = lookup_compartment(id) {
            bindings.insert(id.clone(), compartment.value);
        }
    }
    let lookup = |name: &str| bindings.get(name).copied();

    for (id, value) in &dfe.values {
        if let Ok(v) = value.eval(&lookup) {
            if !v.is_finite() || v < -NEGATIVE_TOLERANCE {
                return Err(ModelError::NoDiseaseFreeEquilibrium(format!(
                    "{id} would be {v} at the equilibrium"
                )));
            }
        }
    }

    let at_dfe = dfe.substitutions(&infected);
    let infected_set: HashSet<&str> = infected.iter().map(String::as_str).collect();

    let mut new_infections = Vec::with_capacity(infected.len());
    let mut transfers = Vec::with_capacity(infected.len());
    for id in &infected {
        let equation = system
            .equation(id)
            .ok_or_else(|| ModelError::UnknownCompartment(id.clone()))?;
        let f = Expr::sum(
            equation
                .infection_inflows
                .iter()
                .filter(|inflow| {
                    inflow
                        .source
                        .compartment()
                        .map_or(true, |source| !infected_set.contains(source))
                })
                .map(|inflow| inflow.rate.clone()),
        )
        .simplify();
        let v = (f.clone() - equation.rhs.clone()).simplify();
        new_infections.push(f);
        transfers.push(v);
    }

    let jacobian_at_dfe = |terms: &[Expr]| -> Vec<Vec<Expr>> {
        terms
            .iter()
            .map(|term| {
                infected
                    .iter()
                    .map(|x| term.diff(x).subs(&at_dfe))
                    .collect()
            })
            .collect()
    };
    let f_matrix = jacobian_at_dfe(&new_infections);
    let v_matrix = jacobian_at_dfe(&transfers);
    debug!("F = {f_matrix:?}");
    debug!("V = {v_matrix:?}");

    let v_inverse = invert_matrix(&v_matrix).ok_or(ModelError::SingularVMatrix)?;
    if let Some(values) = evaluate_matrix(&v_matrix, &lookup) {
        let m = infected.len();
        let scale = values.iter().fold(0.0f64, |acc, v| acc.max(v.abs())).max(1.0);
        let det = DMatrix::from_row_slice(m, m, &values).determinant();
        if !det.is_finite() || det.abs() <= SINGULAR_TOLERANCE * scale.powi(m as i32) {
            return Err(ModelError::SingularVMatrix);
        }
    }

    let k = matrix_product(&f_matrix, &v_inverse);
    let k_values = evaluate_matrix(&k, &lookup);
    let eigenvalues = k_values
        .as_ref()
        .map(|values| {
            let m = infected.len();
            DMatrix::from_row_slice(m, m, values)
                .complex_eigenvalues()
                .iter()
                .copied()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let (formula, closed_form) = match spectral_radius(&f_matrix, &k) {
        Some(formula) => (formula, true),
        None => {
            if k_values.is_none() {
                let missing: BTreeSet<String> = k
                    .iter()
                    .flatten()
                    .flat_map(Expr::free_symbols)
                    .filter(|s| !bindings.contains_key(s))
                    .collect();
                return Err(ModelError::UnboundParameter(missing.into_iter().collect()));
            }
            let radius = eigenvalues.iter().map(|l| l.norm()).fold(0.0, f64::max);
            (Expr::num(radius), false)
        }
    };

    let value = formula.eval(&lookup).ok().filter(|v| v.is_finite());
    let plaintext = formula.to_string();
    let latex = formula.to_latex();
    info!("R0 = {plaintext} (value: {value:?})");

    Ok(R0Result {
        is_exact: closed_form && dfe.is_exact,
        formula,
        plaintext,
        latex,
        value,
        infected,
        disease_free_equilibrium: dfe,
        next_generation_matrix: k,
        eigenvalues,
    })
}

/// Closed-form spectral radius of `k` where one exists.
fn spectral_radius(f: &[Vec<Expr>], k: &[Vec<Expr>]) -> Option<Expr> {
    let nonzero_rows: Vec<usize> = f
        .iter()
        .enumerate()
        .filter(|(_, row)| row.iter().any(|e| !e.is_zero()))
        .map(|(i, _)| i)
        .collect();

    match (k.len(), nonzero_rows.as_slice()) {
        (_, []) => Some(Expr::zero()),
        (1, _) => Some(k[0][0].clone()),
        // Only row r of K is non-zero, so its eigenvalues are K[r][r] and zeros.
        (_, [r]) => Some(k[*r][*r].clone()),
        (2, _) => {
            let trace = (k[0][0].clone() + k[1][1].clone()).simplify();
            let det = (k[0][0].clone() * k[1][1].clone() - k[0][1].clone() * k[1][0].clone())
                .simplify();
            if det.is_zero() {
                return Some(trace);
            }
            let discriminant = trace.clone().powi(2) - Expr::num(4.0) * det;
            Some(((trace + discriminant.sqrt()) / Expr::num(2.0)).simplify())
        }
        _ => None,
    }
}

fn evaluate_matrix<F>(matrix: &[Vec<Expr>], lookup: &F) -> Option<Vec<f64>>
where
    F: Fn(&str) -> Option<f64>,
{
    matrix
        .iter()
        .flatten()
        .map(|e| e.eval(lookup).ok())
        .collect()
}
