//! Limited-memory BFGS over a flat parameter vector.
//!
//! Each call to `Lbfgs::minimize` starts with an empty history and runs until
//! it converges or its evaluation budget is spent, so a caller can checkpoint
//! between calls. The objective is always asked for the loss and then for the
//! gradient at the same point, never anything else.

use crate::Error;
use std::collections::VecDeque;

/// Sufficient decrease parameter of the line search
const C1: f64 = 1e-3;
/// Curvature parameter of the line search
const C2: f64 = 0.9;

/// A function the optimizer can minimize.
///
/// For every point the optimizer visits it calls `loss(x)` and then
/// `grads(x)` with the same `x`, so an implementation may compute both in one
/// pass and hand out the gradient on the second call.
pub trait Objective {
    fn loss(&mut self, x: &[f64]) -> Result<f64, Error>;
    fn grads(&mut self, x: &[f64]) -> Result<Vec<f64>, Error>;
}

/// Why a call to `Lbfgs::minimize` returned
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The largest gradient component fell below `pgtol`
    GradientTolerance,
    /// The relative reduction of the loss fell below `factr * f64::EPSILON`
    RelativeReduction,
    /// The function evaluation budget was used up
    MaxEvaluations,
    /// The iteration limit was reached
    MaxIterations,
    /// The line search could not find a lower loss along any direction
    LineSearchFailed,
}

/// The result of one bounded minimization
#[derive(Clone, Debug)]
pub struct Minimum {
    /// The best point found
    pub x: Vec<f64>,
    /// The loss at `x`
    pub loss: f64,
    /// The loss at the starting point
    pub start_loss: f64,
    /// Number of loss and gradient evaluations
    pub evaluations: usize,
    /// Number of accepted steps
    pub iterations: usize,
    pub termination: Termination,
}

/// L-BFGS configuration. The defaults mirror the classic `L-BFGS-B` driver:
/// 10 corrections, `pgtol = 1e-5`, `factr = 1e7` and 15000 iterations, with a
/// budget of 20 evaluations per call.
#[derive(Copy, Clone, Debug)]
pub struct Lbfgs {
    memory: usize,
    max_evals: usize,
    max_iters: usize,
    pgtol: f64,
    factr: f64,
    max_line_search: usize,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self {
            memory: 10,
            max_evals: 20,
            max_iters: 15000,
            pgtol: 1e-5,
            factr: 1e7,
            max_line_search: 20,
        }
    }
}

struct Correction {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

#[derive(Clone)]
struct Step {
    alpha: f64,
    x: Vec<f64>,
    f: f64,
    g: Vec<f64>,
    /// Directional derivative at `x`
    dg: f64,
}

/// Counts evaluations and keeps the loss/grads calls paired.
struct Counted<'a, O> {
    objective: &'a mut O,
    evaluations: usize,
}

impl<'a, O: Objective> Counted<'a, O> {
    fn eval(&mut self, x: &[f64]) -> Result<(f64, Vec<f64>), Error> {
        let f = self.objective.loss(x)?;
        let g = self.objective.grads(x)?;
        self.evaluations += 1;
        Ok((f, g))
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

impl Lbfgs {
    /// Number of corrections kept in the history
    pub fn memory(mut self, memory: usize) -> Self {
        self.memory = memory.max(1);
        self
    }

    /// Stop once this many evaluations have been made. The budget is checked
    /// after every accepted step, so the line search of the final step may
    /// exceed it.
    pub fn max_evals(mut self, max_evals: usize) -> Self {
        self.max_evals = max_evals;
        self
    }

    pub fn max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn pgtol(mut self, pgtol: f64) -> Self {
        self.pgtol = pgtol;
        self
    }

    pub fn factr(mut self, factr: f64) -> Self {
        self.factr = factr;
        self
    }

    /// Minimizes `objective` starting from `x0`.
    pub fn minimize<O: Objective>(&self, objective: &mut O, x0: Vec<f64>) -> Result<Minimum, Error> {
        let mut counted = Counted {
            objective,
            evaluations: 0,
        };

        let mut x = x0;
        let (mut f, mut g) = counted.eval(&x)?;
        let start_loss = f;

        let mut history: VecDeque<Correction> = VecDeque::with_capacity(self.memory);
        let mut iterations = 0;

        let termination = loop {
            if inf_norm(&g) <= self.pgtol {
                break Termination::GradientTolerance;
            }

            if iterations >= self.max_iters {
                break Termination::MaxIterations;
            }

            let mut d = direction(&g, &history);
            let mut dg = dot(&d, &g);
            if dg >= 0.0 || dg.is_nan() {
                // not a descent direction, the history is no good
                history.clear();
                d = g.iter().map(|v| -v).collect();
                dg = -dot(&g, &g);
            }

            let initial_step = if history.is_empty() {
                (1.0 / dot(&d, &d).sqrt()).min(1.0)
            } else {
                1.0
            };

            let step = match self.line_search(&mut counted, &x, f, &d, dg, initial_step)? {
                Some(step) => step,
                None if history.is_empty() => break Termination::LineSearchFailed,
                None => {
                    tracing::debug!("line search failed, restarting from steepest descent");
                    history.clear();
                    continue;
                }
            };

            let s: Vec<f64> = step.x.iter().zip(&x).map(|(n, o)| n - o).collect();
            let y: Vec<f64> = step.g.iter().zip(&g).map(|(n, o)| n - o).collect();
            let sy = dot(&s, &y);
            let yy = dot(&y, &y);
            if sy > f64::EPSILON * yy {
                if history.len() == self.memory {
                    history.pop_front();
                }
                history.push_back(Correction { s, y, rho: 1.0 / sy });
            }

            let previous = f;
            x = step.x;
            f = step.f;
            g = step.g;
            iterations += 1;

            tracing::debug!(
                iteration = iterations,
                loss = f,
                step = step.alpha,
                evaluations = counted.evaluations,
                "accepted step"
            );

            let scale = previous.abs().max(f.abs()).max(1.0);
            if (previous - f) / scale <= self.factr * f64::EPSILON {
                break Termination::RelativeReduction;
            }

            if counted.evaluations >= self.max_evals {
                break Termination::MaxEvaluations;
            }
        };

        Ok(Minimum {
            x,
            loss: f,
            start_loss,
            evaluations: counted.evaluations,
            iterations,
            termination,
        })
    }

    fn probe<O: Objective>(
        counted: &mut Counted<'_, O>,
        x: &[f64],
        d: &[f64],
        alpha: f64,
    ) -> Result<Step, Error> {
        let x: Vec<f64> = x.iter().zip(d).map(|(x, d)| x + alpha * d).collect();
        let (f, g) = counted.eval(&x)?;
        let dg = dot(&g, d);
        Ok(Step { alpha, x, f, g, dg })
    }

    /// Searches along `d` for a step satisfying the strong Wolfe conditions.
    /// If none is found within the trial limit, the lowest point satisfying
    /// sufficient decrease is returned instead, if any.
    fn line_search<O: Objective>(
        &self,
        counted: &mut Counted<'_, O>,
        x: &[f64],
        f0: f64,
        d: &[f64],
        dg0: f64,
        initial_step: f64,
    ) -> Result<Option<Step>, Error> {
        let armijo = |step: &Step| step.f.is_finite() && step.f <= f0 + C1 * step.alpha * dg0;
        let curvature = |step: &Step| step.dg.abs() <= -C2 * dg0;

        let mut best: Option<Step> = None;
        let keep_best = |step: &Step, best: &mut Option<Step>| {
            if armijo(step) && best.as_ref().map_or(true, |b| step.f < b.f) {
                *best = Some(step.clone());
            }
        };

        // Bracketing phase: (alpha, f, dg) of the previous trial, starting at 0
        let mut prev = (0.0, f0, dg0);
        let mut prev_step: Option<Step> = None;
        let mut alpha = initial_step;
        let mut trials = 0;

        let (mut lo, mut lo_step, mut hi) = loop {
            if trials >= self.max_line_search {
                return Ok(best);
            }
            trials += 1;

            let step = Self::probe(counted, x, d, alpha)?;
            keep_best(&step, &mut best);

            if !armijo(&step) || (trials > 1 && step.f >= prev.1) {
                break (prev, prev_step, (step.alpha, step.f, step.dg));
            }

            if curvature(&step) {
                return Ok(Some(step));
            }

            if step.dg >= 0.0 {
                let hi = prev;
                break ((step.alpha, step.f, step.dg), Some(step), hi);
            }

            prev = (step.alpha, step.f, step.dg);
            prev_step = Some(step);
            alpha *= 2.0;
        };

        // Zoom phase: `lo` always satisfies sufficient decrease and has the
        // lowest loss of the bracket
        while trials < self.max_line_search {
            trials += 1;

            let alpha = interpolate(lo, hi);
            let step = Self::probe(counted, x, d, alpha)?;
            keep_best(&step, &mut best);

            if !armijo(&step) || step.f >= lo.1 {
                hi = (step.alpha, step.f, step.dg);
                continue;
            }

            if curvature(&step) {
                return Ok(Some(step));
            }

            if step.dg * (hi.0 - lo.0) >= 0.0 {
                hi = lo;
            }
            lo = (step.alpha, step.f, step.dg);
            lo_step = Some(step);
        }

        Ok(lo_step.or(best))
    }
}

/// Two-loop recursion: applies the inverse Hessian approximation to the
/// gradient and negates it.
fn direction(g: &[f64], history: &VecDeque<Correction>) -> Vec<f64> {
    let mut q = g.to_vec();
    let mut alphas = Vec::with_capacity(history.len());

    for c in history.iter().rev() {
        let a = c.rho * dot(&c.s, &q);
        for (q, y) in q.iter_mut().zip(&c.y) {
            *q -= a * y;
        }
        alphas.push(a);
    }

    if let Some(last) = history.back() {
        let gamma = dot(&last.s, &last.y) / dot(&last.y, &last.y);
        for q in q.iter_mut() {
            *q *= gamma;
        }
    }

    for (c, a) in history.iter().zip(alphas.iter().rev()) {
        let b = c.rho * dot(&c.y, &q);
        for (q, s) in q.iter_mut().zip(&c.s) {
            *q += s * (a - b);
        }
    }

    q.iter_mut().for_each(|v| *v = -*v);
    q
}

/// Minimizer of the cubic matching the losses and slopes at both ends of the
/// bracket, kept away from the ends; falls back to bisection.
fn interpolate(lo: (f64, f64, f64), hi: (f64, f64, f64)) -> f64 {
    let (a_lo, f_lo, g_lo) = lo;
    let (a_hi, f_hi, g_hi) = hi;

    let left = a_lo.min(a_hi);
    let right = a_lo.max(a_hi);
    let margin = 0.1 * (right - left);
    let mid = 0.5 * (a_lo + a_hi);

    if !f_hi.is_finite() || !g_hi.is_finite() {
        return mid;
    }

    let d1 = g_lo + g_hi - 3.0 * (f_lo - f_hi) / (a_lo - a_hi);
    let radicand = d1 * d1 - g_lo * g_hi;
    if radicand < 0.0 {
        return mid;
    }

    let d2 = (a_hi - a_lo).signum() * radicand.sqrt();
    let alpha = a_hi - (a_hi - a_lo) * (g_hi + d2 - d1) / (g_hi - g_lo + 2.0 * d2);

    if alpha.is_finite() && alpha >= left + margin && alpha <= right - margin {
        alpha
    } else {
        mid
    }
}
