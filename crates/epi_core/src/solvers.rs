use crate::traits::{AdaptiveSteppable, DynamicalSystem, Scalar, Steppable};

fn constant<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
            k2: vec![T::zero(); dim],
            k3: vec![T::zero(); dim],
            k4: vec![T::zero(); dim],
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let half: T = constant(0.5);
        let sixth: T = constant(1.0 / 6.0);
        let two: T = constant(2.0);

        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1);

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

/// Tsitouras 5/4 Solver with its embedded 4th order error estimate.
pub struct Tsit5<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    k5: Vec<T>,
    k6: Vec<T>,
    k7: Vec<T>,
    tmp: Vec<T>,
    proposal: Vec<T>,
    error: Vec<T>,
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k1: vec![z; dim],
            k2: vec![z; dim],
            k3: vec![z; dim],
            k4: vec![z; dim],
            k5: vec![z; dim],
            k6: vec![z; dim],
            k7: vec![z; dim],
            tmp: vec![z; dim],
            proposal: vec![z; dim],
            error: vec![z; dim],
        }
    }
}

impl<T: Scalar> AdaptiveSteppable<T> for Tsit5<T> {
    fn attempt(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: T,
        state: &[T],
        dt: T,
        proposal: &mut [T],
        error: &mut [T],
    ) {
        let t0 = t;

        // Tsitouras (2011) coefficients; each row of `a` sums to its `c`.
        let c2: T = constant(0.161);
        let c3: T = constant(0.327);
        let c4: T = constant(0.9);
        let c5: T = constant(0.9800255409045097);
        let c6 = T::one();

        let a21: T = constant(0.161);

        let a31: T = constant(-0.008480655492356989);
        let a32: T = constant(0.335480655492357);

        let a41: T = constant(2.897153057105493);
        let a42: T = constant(-6.359448489975075);
        let a43: T = constant(4.3622954328695815);

        let a51: T = constant(5.325864828439257);
        let a52: T = constant(-11.748883564062828);
        let a53: T = constant(7.4955393428898365);
        let a54: T = constant(-0.09249506636175525);

        let a61: T = constant(5.86145544294642);
        let a62: T = constant(-12.92096931784711);
        let a63: T = constant(8.159367898576159);
        let a64: T = constant(-0.071584973281401);
        let a65: T = constant(-0.028269050394068383);

        // b coefficients (5th order), also the last row of the tableau
        let b1: T = constant(0.09646076681806523);
        let b2: T = constant(0.01);
        let b3: T = constant(0.4798896504144996);
        let b4: T = constant(1.379008574103742);
        let b5: T = constant(-3.290069515436081);
        let b6: T = constant(2.324710524099774);

        // difference between the 5th and embedded 4th order weights
        let e1: T = constant(-0.00178001105222577714);
        let e2: T = constant(-0.0008164344596567469);
        let e3: T = constant(0.007880878010261995);
        let e4: T = constant(-0.1447110071732629);
        let e5: T = constant(0.5823571654525552);
        let e6: T = constant(-0.45808210592918697);
        let e7: T = constant(0.015151515151515152);

        // k1
        system.apply(t0, state, &mut self.k1);

        // k2
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * (a21 * self.k1[i]);
        }
        system.apply(t0 + c2 * dt, &self.tmp, &mut self.k2);

        // k3
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * (a31 * self.k1[i] + a32 * self.k2[i]);
        }
        system.apply(t0 + c3 * dt, &self.tmp, &mut self.k3);

        // k4
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * (a41 * self.k1[i] + a42 * self.k2[i] + a43 * self.k3[i]);
        }
        system.apply(t0 + c4 * dt, &self.tmp, &mut self.k4);

        // k5
        for i in 0..state.len() {
            self.tmp[i] = state[i]
                + dt * (a51 * self.k1[i] + a52 * self.k2[i] + a53 * self.k3[i] + a54 * self.k4[i]);
        }
        system.apply(t0 + c5 * dt, &self.tmp, &mut self.k5);

        // k6
        for i in 0..state.len() {
            self.tmp[i] = state[i]
                + dt * (a61 * self.k1[i]
                    + a62 * self.k2[i]
                    + a63 * self.k3[i]
                    + a64 * self.k4[i]
                    + a65 * self.k5[i]);
        }
        system.apply(t0 + c6 * dt, &self.tmp, &mut self.k6);

        // 5th order solution
        for i in 0..state.len() {
            proposal[i] = state[i]
                + dt * (b1 * self.k1[i]
                    + b2 * self.k2[i]
                    + b3 * self.k3[i]
                    + b4 * self.k4[i]
                    + b5 * self.k5[i]
                    + b6 * self.k6[i]);
        }

        // k7 = f(t + dt, y_next)
        system.apply(t0 + dt, proposal, &mut self.k7);

        for i in 0..state.len() {
            error[i] = dt
                * (e1 * self.k1[i]
                    + e2 * self.k2[i]
                    + e3 * self.k3[i]
                    + e4 * self.k4[i]
                    + e5 * self.k5[i]
                    + e6 * self.k6[i]
                    + e7 * self.k7[i]);
        }
    }

    fn error_order(&self) -> usize {
        4
    }
}

impl<T: Scalar> Steppable<T> for Tsit5<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let mut proposal = std::mem::take(&mut self.proposal);
        let mut error = std::mem::take(&mut self.error);
        self.attempt(system, *t, state, dt, &mut proposal, &mut error);
        state.copy_from_slice(&proposal);
        self.proposal = proposal;
        self.error = error;
        *t = *t + dt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// dx/dt = -k x
    struct Decay {
        rate: f64,
    }

    impl DynamicalSystem<f64> for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -self.rate * x[0];
        }
    }

    #[test]
    fn rk4_matches_exponential_decay() {
        let system = Decay { rate: 0.5 };
        let mut solver = RK4::<f64>::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        for _ in 0..100 {
            solver.step(&system, &mut t, &mut state, 0.02);
        }
        assert!((t - 2.0).abs() < 1e-12);
        assert!((state[0] - (-1.0f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn tsit5_step_is_fifth_order_accurate() {
        let system = Decay { rate: 1.0 };
        let mut solver = Tsit5::<f64>::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        for _ in 0..10 {
            solver.step(&system, &mut t, &mut state, 0.1);
        }
        assert!((state[0] - (-1.0f64).exp()).abs() < 1e-7);
    }

    fn tsit5_local_errors(h: f64) -> (f64, f64) {
        let system = Decay { rate: 1.0 };
        let mut solver = Tsit5::<f64>::new(1);
        let mut proposal = [0.0];
        let mut error = [0.0];
        solver.attempt(&system, 0.0, &[1.0], h, &mut proposal, &mut error);
        ((proposal[0] - (-h).exp()).abs(), error[0].abs())
    }

    #[test]
    fn tsit5_local_errors_scale_with_method_order() {
        let (solution_coarse, estimate_coarse) = tsit5_local_errors(0.2);
        let (solution_fine, estimate_fine) = tsit5_local_errors(0.1);
        // Halving h divides the fifth-order local error by ~64 and the
        // embedded fourth-order estimate by ~32.
        let solution_ratio = solution_coarse / solution_fine;
        let estimate_ratio = estimate_coarse / estimate_fine;
        assert!(solution_ratio > 40.0, "solution ratio {solution_ratio}");
        assert!(estimate_ratio > 20.0 && estimate_ratio < 50.0, "estimate ratio {estimate_ratio}");
        // The estimate bounds the true error of the accepted solution.
        assert!(estimate_fine > solution_fine);
    }

    #[test]
    fn tableau_rows_are_consistent() {
        let rows: [(f64, &[f64]); 5] = [
            (0.327, &[-0.008480655492356989, 0.335480655492357]),
            (0.9, &[2.897153057105493, -6.359448489975075, 4.3622954328695815]),
            (
                0.9800255409045097,
                &[5.325864828439257, -11.748883564062828, 7.4955393428898365, -0.09249506636175525],
            ),
            (
                1.0,
                &[5.86145544294642, -12.92096931784711, 8.159367898576159, -0.071584973281401, -0.028269050394068383],
            ),
            (
                1.0,
                &[0.09646076681806523, 0.01, 0.4798896504144996, 1.379008574103742, -3.290069515436081, 2.324710524099774],
            ),
        ];
        for (c, a) in rows {
            let sum: f64 = a.iter().sum();
            assert!((sum - c).abs() < 1e-12, "row for c = {c} sums to {sum}");
        }
    }

    #[test]
    fn tsit5_error_estimate_shrinks_with_step() {
        let system = Decay { rate: 1.0 };
        let mut solver = Tsit5::<f64>::new(1);
        let mut proposal = [0.0];
        let mut coarse = [0.0];
        let mut fine = [0.0];
        solver.attempt(&system, 0.0, &[1.0], 0.4, &mut proposal, &mut coarse);
        solver.attempt(&system, 0.0, &[1.0], 0.1, &mut proposal, &mut fine);
        assert!(coarse[0].abs() > fine[0].abs());
        assert!(fine[0].abs() < 1e-6);
        assert!((proposal[0] - (-0.1f64).exp()).abs() < 1e-8);
    }
}
