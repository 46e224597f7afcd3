//! Symbolic expressions for transition rates and the derived equations.
//!
//! [`Expr::simplify`] rewrites an expression into a canonical form: sums and
//! products are flattened, numeric constants folded, like terms and like
//! powers collected, products of sums expanded and operands sorted. Two
//! polynomial (or Laurent-monomial) expressions that are algebraically equal
//! therefore compare equal with `==`, which is what the zero tests of the R0
//! pipeline rely on.
//!
//! Subtraction is represented as `a + (-1)*b`, division as `a * b^-1` and the
//! square root as `b^0.5`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops;

/// Largest integer power of a sum that is expanded during simplification.
const MAX_EXPANDED_POWER: f64 = 6.0;

const GREEK_LETTERS: &[&str] = &[
    "alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta", "iota", "kappa",
    "lambda", "mu", "nu", "xi", "pi", "rho", "sigma", "tau", "upsilon", "phi", "chi", "psi",
    "omega", "Gamma", "Delta", "Theta", "Lambda", "Xi", "Pi", "Sigma", "Upsilon", "Phi", "Psi",
    "Omega",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Func {
    Sin,
    Cos,
    Exp,
    Ln,
}

impl Func {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(Func::Sin),
            "cos" => Some(Func::Cos),
            "exp" => Some(Func::Exp),
            "ln" | "log" => Some(Func::Ln),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Exp => "exp",
            Func::Ln => "ln",
        }
    }

    pub fn apply(self, x: f64) -> f64 {
        match self {
            Func::Sin => x.sin(),
            Func::Cos => x.cos(),
            Func::Exp => x.exp(),
            Func::Ln => x.ln(),
        }
    }
}

/// Expression tree over numbers and named symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Num(f64),
    Sym(String),
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Func(Func, Box<Expr>),
}

impl Expr {
    pub fn num(value: f64) -> Self {
        Expr::Num(value)
    }

    pub fn sym(name: impl Into<String>) -> Self {
        Expr::Sym(name.into())
    }

    pub fn zero() -> Self {
        Expr::Num(0.0)
    }

    pub fn one() -> Self {
        Expr::Num(1.0)
    }

    pub fn pow(self, exponent: Expr) -> Self {
        Expr::Pow(Box::new(self), Box::new(exponent))
    }

    pub fn powi(self, exponent: i32) -> Self {
        self.pow(Expr::Num(exponent as f64))
    }

    pub fn sqrt(self) -> Self {
        self.pow(Expr::Num(0.5))
    }

    pub fn call(func: Func, arg: Expr) -> Self {
        Expr::Func(func, Box::new(arg))
    }

    pub fn sum(terms: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Add(terms.into_iter().collect())
    }

    pub fn product(factors: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Mul(factors.into_iter().collect())
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Num(v) if *v == 0.0)
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expr::Num(v) if *v == 1.0)
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Expr::Num(v) => Some(*v),
            _ => None,
        }
    }

    /// Rewrites the expression into canonical form.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Num(_) | Expr::Sym(_) => self.clone(),
            Expr::Add(terms) => simplify_add(terms.iter().map(Expr::simplify).collect()),
            Expr::Mul(factors) => simplify_mul(factors.iter().map(Expr::simplify).collect()),
            Expr::Pow(base, exponent) => {
                let exponent = exponent.simplify();
                match (&**base, exponent.as_num()) {
                    // Distribute first so a quotient keeps its factored denominator.
                    (Expr::Mul(factors), Some(n)) if is_integer(n) => simplify_mul(
                        factors
                            .iter()
                            .map(|factor| simplify_pow(factor.simplify(), Expr::Num(n)))
                            .collect(),
                    ),
                    _ => simplify_pow(base.simplify(), exponent),
                }
            }
            Expr::Func(func, arg) => simplify_func(*func, arg.simplify()),
        }
    }

    /// Replaces symbols by expressions and simplifies the result.
    pub fn subs(&self, replacements: &HashMap<String, Expr>) -> Expr {
        self.replace(replacements).simplify()
    }

    fn replace(&self, replacements: &HashMap<String, Expr>) -> Expr {
        match self {
            Expr::Num(_) => self.clone(),
            Expr::Sym(name) => replacements
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Expr::Add(terms) => Expr::Add(terms.iter().map(|t| t.replace(replacements)).collect()),
            Expr::Mul(factors) => {
                Expr::Mul(factors.iter().map(|f| f.replace(replacements)).collect())
            }
            Expr::Pow(base, exponent) => base
                .replace(replacements)
                .pow(exponent.replace(replacements)),
            Expr::Func(func, arg) => Expr::call(*func, arg.replace(replacements)),
        }
    }

    /// Partial derivative with respect to `symbol`, simplified.
    pub fn diff(&self, symbol: &str) -> Expr {
        self.derivative(symbol).simplify()
    }

    fn derivative(&self, symbol: &str) -> Expr {
        match self {
            Expr::Num(_) => Expr::zero(),
            Expr::Sym(name) => {
                if name == symbol {
                    Expr::one()
                } else {
                    Expr::zero()
                }
            }
            Expr::Add(terms) => Expr::Add(terms.iter().map(|t| t.derivative(symbol)).collect()),
            Expr::Mul(factors) => {
                // Product rule, skipping factors that do not depend on the symbol.
                let mut terms = Vec::new();
                for (index, factor) in factors.iter().enumerate() {
                    if !factor.contains_symbol(symbol) {
                        continue;
                    }
                    let mut product = factors.clone();
                    product[index] = factor.derivative(symbol);
                    terms.push(Expr::Mul(product));
                }
                Expr::Add(terms)
            }
            Expr::Pow(base, exponent) => {
                let base_varies = base.contains_symbol(symbol);
                let exponent_varies = exponent.contains_symbol(symbol);
                match (base_varies, exponent_varies) {
                    (false, false) => Expr::zero(),
                    (true, false) => Expr::product([
                        (**exponent).clone(),
                        (**base).clone().pow((**exponent).clone() - Expr::one()),
                        base.derivative(symbol),
                    ]),
                    (false, true) => Expr::product([
                        self.clone(),
                        Expr::call(Func::Ln, (**base).clone()),
                        exponent.derivative(symbol),
                    ]),
                    (true, true) => Expr::product([
                        self.clone(),
                        Expr::sum([
                            Expr::product([
                                exponent.derivative(symbol),
                                Expr::call(Func::Ln, (**base).clone()),
                            ]),
                            Expr::product([
                                (**exponent).clone(),
                                base.derivative(symbol),
                                (**base).clone().powi(-1),
                            ]),
                        ]),
                    ]),
                }
            }
            Expr::Func(func, arg) => {
                let inner = arg.derivative(symbol);
                let outer = match func {
                    Func::Sin => Expr::call(Func::Cos, (**arg).clone()),
                    Func::Cos => -Expr::call(Func::Sin, (**arg).clone()),
                    Func::Exp => self.clone(),
                    Func::Ln => (**arg).clone().powi(-1),
                };
                Expr::product([outer, inner])
            }
        }
    }

    pub fn contains_symbol(&self, symbol: &str) -> bool {
        match self {
            Expr::Num(_) => false,
            Expr::Sym(name) => name == symbol,
            Expr::Add(items) | Expr::Mul(items) => items.iter().any(|e| e.contains_symbol(symbol)),
            Expr::Pow(base, exponent) => {
                base.contains_symbol(symbol) || exponent.contains_symbol(symbol)
            }
            Expr::Func(_, arg) => arg.contains_symbol(symbol),
        }
    }

    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut symbols = BTreeSet::new();
        self.collect_symbols(&mut symbols);
        symbols
    }

    fn collect_symbols(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Num(_) => {}
            Expr::Sym(name) => {
                out.insert(name.clone());
            }
            Expr::Add(items) | Expr::Mul(items) => {
                for item in items {
                    item.collect_symbols(out);
                }
            }
            Expr::Pow(base, exponent) => {
                base.collect_symbols(out);
                exponent.collect_symbols(out);
            }
            Expr::Func(_, arg) => arg.collect_symbols(out),
        }
    }

    /// Evaluates numerically. On failure returns the first symbol `lookup`
    /// could not resolve.
    pub fn eval<F>(&self, lookup: &F) -> Result<f64, String>
    where
        F: Fn(&str) -> Option<f64>,
    {
        match self {
            Expr::Num(v) => Ok(*v),
            Expr::Sym(name) => lookup(name).ok_or_else(|| name.clone()),
            Expr::Add(terms) => terms
                .iter()
                .try_fold(0.0, |acc, term| Ok(acc + term.eval(lookup)?)),
            Expr::Mul(factors) => factors
                .iter()
                .try_fold(1.0, |acc, factor| Ok(acc * factor.eval(lookup)?)),
            Expr::Pow(base, exponent) => {
                let b = base.eval(lookup)?;
                let e = exponent.eval(lookup)?;
                if e.fract() == 0.0 && e.abs() <= i32::MAX as f64 {
                    Ok(b.powi(e as i32))
                } else {
                    Ok(b.powf(e))
                }
            }
            Expr::Func(func, arg) => Ok(func.apply(arg.eval(lookup)?)),
        }
    }

    pub fn to_latex(&self) -> String {
        render_latex(self)
    }
}

impl ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::Add(vec![self, rhs])
    }
}

impl ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::Add(vec![self, -rhs])
    }
}

impl ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::Mul(vec![self, rhs])
    }
}

impl ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::Mul(vec![self, rhs.powi(-1)])
    }
}

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        match self {
            Expr::Num(v) => Expr::Num(-v),
            other => Expr::Mul(vec![Expr::Num(-1.0), other]),
        }
    }
}

// --- Canonical form ---

fn simplify_add(terms: Vec<Expr>) -> Expr {
    let mut flat = Vec::with_capacity(terms.len());
    for term in terms {
        match term {
            Expr::Add(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }

    let mut constant = 0.0;
    let mut collected: Vec<(Expr, f64)> = Vec::new();
    for term in flat {
        if let Expr::Num(value) = term {
            constant += value;
            continue;
        }
        let (coefficient, monomial) = split_coefficient(term);
        match collected.iter_mut().find(|(existing, _)| *existing == monomial) {
            Some((_, total)) => *total += coefficient,
            None => collected.push((monomial, coefficient)),
        }
    }

    let mut out: Vec<Expr> = collected
        .into_iter()
        .filter(|(_, coefficient)| *coefficient != 0.0)
        .map(|(monomial, coefficient)| with_coefficient(coefficient, monomial))
        .collect();
    if constant != 0.0 {
        out.push(Expr::Num(constant));
    }
    out.sort_by(compare_terms);

    match out.len() {
        0 => Expr::zero(),
        1 => out.remove(0),
        _ => Expr::Add(out),
    }
}

fn simplify_mul(factors: Vec<Expr>) -> Expr {
    let mut flat = Vec::with_capacity(factors.len());
    for factor in factors {
        match factor {
            Expr::Mul(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }

    let mut coefficient = 1.0;
    let mut groups: Vec<(Expr, Vec<Expr>)> = Vec::new();
    for factor in flat {
        let (base, exponent) = match factor {
            Expr::Num(value) => {
                coefficient *= value;
                continue;
            }
            Expr::Pow(base, exponent) => (*base, *exponent),
            other => (other, Expr::one()),
        };
        match groups.iter_mut().find(|(existing, _)| *existing == base) {
            Some((_, exponents)) => exponents.push(exponent),
            None => groups.push((base, vec![exponent])),
        }
    }
    if coefficient == 0.0 {
        return Expr::zero();
    }

    let mut combined = Vec::with_capacity(groups.len());
    let mut reprocess = Vec::new();
    for (base, exponents) in groups {
        match simplify_pow(base, simplify_add(exponents)) {
            Expr::Num(value) => coefficient *= value,
            Expr::Mul(inner) => reprocess.extend(inner),
            other => combined.push(other),
        }
    }
    if !reprocess.is_empty() {
        combined.extend(reprocess);
        combined.push(Expr::Num(coefficient));
        return simplify_mul(combined);
    }
    if coefficient == 0.0 {
        return Expr::zero();
    }

    let mut sums = Vec::new();
    let mut others = Vec::new();
    for factor in combined {
        match factor {
            Expr::Add(terms) => sums.push(terms),
            other => others.push(other),
        }
    }

    if let Some(first) = sums.pop() {
        let mut prefix = others;
        prefix.push(Expr::Num(coefficient));
        prefix.extend(sums.into_iter().map(Expr::Add));
        let distributed = first
            .into_iter()
            .map(|term| {
                let mut product = prefix.clone();
                product.push(term);
                simplify_mul(product)
            })
            .collect();
        return simplify_add(distributed);
    }

    others.sort_by(compare_factors);
    if coefficient != 1.0 || others.is_empty() {
        others.insert(0, Expr::Num(coefficient));
    }
    match others.len() {
        1 => others.remove(0),
        _ => Expr::Mul(others),
    }
}

fn simplify_pow(base: Expr, exponent: Expr) -> Expr {
    if exponent.is_zero() {
        return Expr::one();
    }
    if exponent.is_one() {
        return base;
    }
    match (base, exponent) {
        (Expr::Num(b), Expr::Num(e)) => {
            let value = b.powf(e);
            if value.is_finite() {
                Expr::Num(value)
            } else {
                Expr::Num(b).pow(Expr::Num(e))
            }
        }
        (Expr::Num(b), _) if b == 1.0 => Expr::one(),
        (Expr::Pow(inner, e), Expr::Num(n)) if is_integer(n) => {
            simplify_pow(*inner, simplify_mul(vec![*e, Expr::Num(n)]))
        }
        (Expr::Mul(factors), Expr::Num(n)) if is_integer(n) => simplify_mul(
            factors
                .into_iter()
                .map(|factor| simplify_pow(factor, Expr::Num(n)))
                .collect(),
        ),
        (Expr::Add(terms), Expr::Num(n)) if is_integer(n) && (2.0..=MAX_EXPANDED_POWER).contains(&n) => {
            let mut expanded = Expr::Add(terms.clone());
            for _ in 1..(n as usize) {
                expanded = distribute(&expanded, &terms);
            }
            expanded
        }
        (Expr::Func(Func::Exp, arg), exponent) => {
            simplify_func(Func::Exp, simplify_mul(vec![*arg, exponent]))
        }
        (base, exponent) => base.pow(exponent),
    }
}

/// Multiplies a canonical expression by the sum of `terms`, term by term.
fn distribute(expr: &Expr, terms: &[Expr]) -> Expr {
    let left: &[Expr] = match expr {
        Expr::Add(items) => items,
        other => std::slice::from_ref(other),
    };
    let products = left
        .iter()
        .flat_map(|a| terms.iter().map(move |b| simplify_mul(vec![a.clone(), b.clone()])))
        .collect();
    simplify_add(products)
}

fn simplify_func(func: Func, arg: Expr) -> Expr {
    match (func, arg) {
        (func, Expr::Num(v)) => {
            let value = func.apply(v);
            if value.is_finite() {
                Expr::Num(value)
            } else {
                Expr::call(func, Expr::Num(v))
            }
        }
        (Func::Ln, Expr::Func(Func::Exp, inner)) => *inner,
        (Func::Exp, Expr::Func(Func::Ln, inner)) => *inner,
        (func, arg) => Expr::call(func, arg),
    }
}

fn is_integer(value: f64) -> bool {
    value.fract() == 0.0 && value.is_finite()
}

fn split_coefficient(term: Expr) -> (f64, Expr) {
    match term {
        Expr::Mul(mut factors) => match factors.first() {
            Some(Expr::Num(c)) => {
                let c = *c;
                factors.remove(0);
                (c, rebuild_product(factors))
            }
            _ => (1.0, Expr::Mul(factors)),
        },
        other => (1.0, other),
    }
}

fn rebuild_product(mut factors: Vec<Expr>) -> Expr {
    match factors.len() {
        0 => Expr::one(),
        1 => factors.remove(0),
        _ => Expr::Mul(factors),
    }
}

fn with_coefficient(coefficient: f64, monomial: Expr) -> Expr {
    if coefficient == 1.0 {
        return monomial;
    }
    match monomial {
        Expr::Num(v) => Expr::Num(coefficient * v),
        Expr::Mul(factors) => {
            let mut out = Vec::with_capacity(factors.len() + 1);
            out.push(Expr::Num(coefficient));
            out.extend(factors);
            Expr::Mul(out)
        }
        other => Expr::Mul(vec![Expr::Num(coefficient), other]),
    }
}

fn rank(expr: &Expr) -> u8 {
    match expr {
        Expr::Num(_) => 0,
        Expr::Sym(_) => 1,
        Expr::Func(_, _) => 2,
        Expr::Pow(_, _) => 3,
        Expr::Mul(_) => 4,
        Expr::Add(_) => 5,
    }
}

fn canonical_cmp(a: &Expr, b: &Expr) -> Ordering {
    match (a, b) {
        (Expr::Num(x), Expr::Num(y)) => x.total_cmp(y),
        (Expr::Sym(x), Expr::Sym(y)) => x.cmp(y),
        (Expr::Add(x), Expr::Add(y)) | (Expr::Mul(x), Expr::Mul(y)) => compare_slices(x, y),
        (Expr::Pow(bx, ex), Expr::Pow(by, ey)) => {
            canonical_cmp(bx, by).then_with(|| canonical_cmp(ex, ey))
        }
        (Expr::Func(fx, ax), Expr::Func(fy, ay)) => fx.cmp(fy).then_with(|| canonical_cmp(ax, ay)),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn compare_slices(a: &[Expr], b: &[Expr]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ordering = canonical_cmp(x, y);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

/// Factors sort by base first so that `x` and `x^-1` style factors of the
/// same symbol stay next to each other.
fn compare_factors(a: &Expr, b: &Expr) -> Ordering {
    let (base_a, exponent_a) = base_and_exponent(a);
    let (base_b, exponent_b) = base_and_exponent(b);
    canonical_cmp(base_a, base_b).then_with(|| match (exponent_a, exponent_b) {
        (Some(x), Some(y)) => canonical_cmp(x, y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    })
}

fn base_and_exponent(expr: &Expr) -> (&Expr, Option<&Expr>) {
    match expr {
        Expr::Pow(base, exponent) => (base, Some(exponent)),
        other => (other, None),
    }
}

fn term_parts(term: &Expr) -> (f64, &[Expr]) {
    match term {
        Expr::Num(v) => (*v, &[]),
        Expr::Mul(factors) => match factors.split_first() {
            Some((Expr::Num(c), rest)) => (*c, rest),
            _ => (1.0, factors.as_slice()),
        },
        other => (1.0, std::slice::from_ref(other)),
    }
}

fn compare_terms(a: &Expr, b: &Expr) -> Ordering {
    let (coefficient_a, monomial_a) = term_parts(a);
    let (coefficient_b, monomial_b) = term_parts(b);
    compare_slices(monomial_a, monomial_b).then_with(|| coefficient_a.total_cmp(&coefficient_b))
}

// --- Linear algebra over expressions ---

/// Outcome of [`solve_linear`].
#[derive(Debug, Clone, PartialEq)]
pub enum LinearSolution {
    /// One entry per unknown; `None` marks an unknown the equations leave free.
    Solved(Vec<Option<Expr>>),
    /// Elimination produced `0 = residual` with a non-zero residual.
    Inconsistent(Expr),
    /// The named equation is not affine in the unknowns.
    Nonlinear(String),
}

enum TermClass {
    Constant,
    Linear(usize, Expr),
    Nonlinear,
}

fn classify_term(term: &Expr, unknowns: &[String]) -> TermClass {
    let factors: &[Expr] = match term {
        Expr::Mul(factors) => factors,
        other => std::slice::from_ref(other),
    };
    let mut found: Option<(usize, usize)> = None;
    for (position, factor) in factors.iter().enumerate() {
        if let Expr::Sym(name) = factor {
            if let Some(index) = unknowns.iter().position(|u| u == name) {
                if found.is_some() {
                    return TermClass::Nonlinear;
                }
                found = Some((index, position));
                continue;
            }
        }
        if unknowns.iter().any(|u| factor.contains_symbol(u)) {
            return TermClass::Nonlinear;
        }
    }
    match found {
        Some((index, position)) => {
            let mut rest = factors.to_vec();
            rest.remove(position);
            TermClass::Linear(index, rebuild_product(rest))
        }
        None => TermClass::Constant,
    }
}

fn affine_coefficients(expression: &Expr, unknowns: &[String]) -> Option<(Vec<Expr>, Expr)> {
    let mut coefficients = vec![Vec::new(); unknowns.len()];
    let mut constant = Vec::new();
    let terms: &[Expr] = match expression {
        Expr::Add(terms) => terms,
        other => std::slice::from_ref(other),
    };
    for term in terms {
        match classify_term(term, unknowns) {
            TermClass::Constant => constant.push(term.clone()),
            TermClass::Linear(index, coefficient) => coefficients[index].push(coefficient),
            TermClass::Nonlinear => return None,
        }
    }
    Some((
        coefficients.into_iter().map(simplify_add).collect(),
        simplify_add(constant),
    ))
}

/// Gauss-Jordan elimination over the first `columns` columns of `rows`.
/// Returns the pivot row of each column, `None` for columns without a pivot.
fn eliminate(rows: &mut [Vec<Expr>], columns: usize) -> Vec<Option<usize>> {
    let mut pivots = vec![None; columns];
    let mut rank = 0;
    for column in 0..columns {
        let Some(found) = (rank..rows.len()).find(|&r| !rows[r][column].is_zero()) else {
            continue;
        };
        rows.swap(rank, found);

        let inverse = rows[rank][column].clone().powi(-1);
        rows[rank] = rows[rank]
            .iter()
            .map(|entry| (entry.clone() * inverse.clone()).simplify())
            .collect();

        for other in 0..rows.len() {
            if other == rank || rows[other][column].is_zero() {
                continue;
            }
            let factor = rows[other][column].clone();
            rows[other] = rows[other]
                .iter()
                .zip(&rows[rank])
                .map(|(entry, pivot_entry)| {
                    (entry.clone() - factor.clone() * pivot_entry.clone()).simplify()
                })
                .collect();
        }

        pivots[column] = Some(rank);
        rank += 1;
    }
    pivots
}

/// Solves `equations[i] = 0` for `unknowns`, provided every equation is
/// affine in them. Unknowns without a pivot stay free and appear by name in
/// the other solutions.
pub fn solve_linear(equations: &[Expr], unknowns: &[String]) -> LinearSolution {
    let width = unknowns.len();
    let mut rows = Vec::with_capacity(equations.len());
    for equation in equations {
        let canonical = equation.simplify();
        match affine_coefficients(&canonical, unknowns) {
            Some((mut row, constant)) => {
                row.push((-constant).simplify());
                rows.push(row);
            }
            None => return LinearSolution::Nonlinear(canonical.to_string()),
        }
    }

    let pivots = eliminate(&mut rows, width);
    let rank = pivots.iter().flatten().count();
    if let Some(row) = rows[rank..].iter().find(|row| !row[width].is_zero()) {
        return LinearSolution::Inconsistent((-row[width].clone()).simplify());
    }

    let solution = pivots
        .iter()
        .map(|pivot| {
            pivot.map(|row| {
                let mut terms = vec![rows[row][width].clone()];
                for (column, other) in pivots.iter().enumerate() {
                    if other.is_none() && !rows[row][column].is_zero() {
                        terms.push(-(rows[row][column].clone() * Expr::sym(&unknowns[column])));
                    }
                }
                Expr::Add(terms).simplify()
            })
        })
        .collect();
    LinearSolution::Solved(solution)
}

/// Inverse of a square matrix, or `None` when it is symbolically singular.
pub fn invert_matrix(matrix: &[Vec<Expr>]) -> Option<Vec<Vec<Expr>>> {
    let n = matrix.len();
    let mut rows: Vec<Vec<Expr>> = matrix
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut augmented = row.clone();
            augmented.extend((0..n).map(|j| if i == j { Expr::one() } else { Expr::zero() }));
            augmented
        })
        .collect();
    let pivots = eliminate(&mut rows, n);
    if pivots.iter().any(Option::is_none) {
        return None;
    }
    Some(rows.into_iter().map(|row| row[n..].to_vec()).collect())
}

pub fn matrix_product(a: &[Vec<Expr>], b: &[Vec<Expr>]) -> Vec<Vec<Expr>> {
    let columns = b.first().map_or(0, Vec::len);
    a.iter()
        .map(|row| {
            (0..columns)
                .map(|j| {
                    Expr::sum(row.iter().zip(b).map(|(x, b_row)| x.clone() * b_row[j].clone()))
                        .simplify()
                })
                .collect()
        })
        .collect()
}

// --- Rendering ---

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Binding strength used to decide on parentheses.
fn precedence(expr: &Expr) -> u8 {
    match expr {
        Expr::Add(_) => 1,
        Expr::Num(v) if *v < 0.0 => 1,
        Expr::Mul(factors) if matches!(factors.first(), Some(Expr::Num(c)) if *c < 0.0) => 1,
        Expr::Mul(_) => 2,
        Expr::Pow(_, exponent) if exponent.as_num().is_some_and(|e| e < 0.0) => 2,
        Expr::Pow(_, _) => 3,
        _ => 4,
    }
}

fn split_sign(term: &Expr) -> (bool, Expr) {
    match term {
        Expr::Num(v) if *v < 0.0 => (true, Expr::Num(-v)),
        Expr::Mul(factors) => match factors.split_first() {
            Some((Expr::Num(c), rest)) if *c < 0.0 => {
                let mut magnitude = Vec::with_capacity(factors.len());
                if *c != -1.0 {
                    magnitude.push(Expr::Num(-c));
                }
                magnitude.extend(rest.iter().cloned());
                (true, rebuild_product(magnitude))
            }
            _ => (false, term.clone()),
        },
        _ => (false, term.clone()),
    }
}

/// Splits a product into coefficient, numerator and denominator factors.
fn split_fraction(factors: &[Expr]) -> (f64, Vec<Expr>, Vec<Expr>) {
    let mut coefficient = 1.0;
    let mut numerator = Vec::new();
    let mut denominator = Vec::new();
    for factor in factors {
        match factor {
            Expr::Num(v) => coefficient *= v,
            Expr::Pow(base, exponent) if exponent.as_num().is_some_and(|e| e < 0.0) => {
                let flipped = -exponent.as_num().unwrap_or(-1.0);
                if flipped == 1.0 {
                    denominator.push((**base).clone());
                } else {
                    denominator.push((**base).clone().pow(Expr::Num(flipped)));
                }
            }
            other => numerator.push(other.clone()),
        }
    }
    (coefficient, numerator, denominator)
}

fn render_sum(terms: &[Expr], render: fn(&Expr) -> String) -> String {
    let mut out = String::new();
    for (index, term) in terms.iter().enumerate() {
        let (negative, magnitude) = split_sign(term);
        let text = render(&magnitude);
        match (index, negative) {
            (0, true) => {
                out.push('-');
                out.push_str(&text);
            }
            (0, false) => out.push_str(&text),
            (_, true) => {
                out.push_str(" - ");
                out.push_str(&text);
            }
            (_, false) => {
                out.push_str(" + ");
                out.push_str(&text);
            }
        }
    }
    out
}

fn wrap_plain(expr: &Expr, minimum: u8) -> String {
    if precedence(expr) < minimum {
        format!("({})", render_plain(expr))
    } else {
        render_plain(expr)
    }
}

fn render_plain_product(factors: &[Expr]) -> String {
    let (coefficient, numerator, denominator) = split_fraction(factors);
    let sign = if coefficient < 0.0 { "-" } else { "" };
    let magnitude = coefficient.abs();

    let mut parts = Vec::new();
    if magnitude != 1.0 || numerator.is_empty() {
        parts.push(format_number(magnitude));
    }
    parts.extend(numerator.iter().map(|f| wrap_plain(f, 2)));
    let mut text = format!("{sign}{}", parts.join("*"));

    match denominator.len() {
        0 => {}
        1 => {
            text.push('/');
            text.push_str(&wrap_plain(&denominator[0], 3));
        }
        _ => {
            let inner: Vec<String> = denominator.iter().map(|f| wrap_plain(f, 2)).collect();
            text.push_str(&format!("/({})", inner.join("*")));
        }
    }
    text
}

fn render_plain(expr: &Expr) -> String {
    match expr {
        Expr::Num(v) => format_number(*v),
        Expr::Sym(name) => name.clone(),
        Expr::Add(terms) => render_sum(terms, render_plain),
        Expr::Mul(factors) => render_plain_product(factors),
        Expr::Pow(base, exponent) => match exponent.as_num() {
            Some(e) if e < 0.0 => render_plain_product(std::slice::from_ref(expr)),
            Some(e) if e == 0.5 => format!("sqrt({})", render_plain(base)),
            _ => format!("{}^{}", wrap_plain(base, 4), wrap_plain(exponent, 4)),
        },
        Expr::Func(func, arg) => format!("{}({})", func.name(), render_plain(arg)),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_plain(self))
    }
}

fn latex_symbol(name: &str) -> String {
    let (base, subscript) = match name.split_once('_') {
        Some((base, subscript)) if !base.is_empty() && !subscript.is_empty() => {
            (base, Some(subscript))
        }
        _ => (name, None),
    };
    let base = if GREEK_LETTERS.contains(&base) {
        format!("\\{base}")
    } else {
        base.to_string()
    };
    match subscript {
        Some(subscript) => format!("{base}_{{{subscript}}}"),
        None => base,
    }
}

fn wrap_latex(expr: &Expr, minimum: u8) -> String {
    if precedence(expr) < minimum {
        format!("\\left({}\\right)", render_latex(expr))
    } else {
        render_latex(expr)
    }
}

fn render_latex_product(factors: &[Expr]) -> String {
    let (coefficient, numerator, denominator) = split_fraction(factors);
    let sign = if coefficient < 0.0 { "-" } else { "" };
    let magnitude = coefficient.abs();

    let mut parts = Vec::new();
    if magnitude != 1.0 || numerator.is_empty() {
        parts.push(format_number(magnitude));
    }
    parts.extend(numerator.iter().map(|f| wrap_latex(f, 2)));
    let top = parts.join(" ");

    if denominator.is_empty() {
        return format!("{sign}{top}");
    }
    let bottom: Vec<String> = denominator.iter().map(|f| wrap_latex(f, 2)).collect();
    format!("{sign}\\frac{{{top}}}{{{}}}", bottom.join(" "))
}

fn render_latex(expr: &Expr) -> String {
    match expr {
        Expr::Num(v) => format_number(*v),
        Expr::Sym(name) => latex_symbol(name),
        Expr::Add(terms) => render_sum(terms, render_latex),
        Expr::Mul(factors) => render_latex_product(factors),
        Expr::Pow(base, exponent) => match exponent.as_num() {
            Some(e) if e < 0.0 => render_latex_product(std::slice::from_ref(expr)),
            Some(e) if e == 0.5 => format!("\\sqrt{{{}}}", render_latex(base)),
            _ => format!("{}^{{{}}}", wrap_latex(base, 4), render_latex(exponent)),
        },
        Expr::Func(Func::Exp, arg) => format!("e^{{{}}}", render_latex(arg)),
        Expr::Func(func, arg) => {
            format!("\\{}\\left({}\\right)", func.name(), render_latex(arg))
        }
    }
}
