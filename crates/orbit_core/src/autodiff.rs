use crate::traits::DynamicalSystem;
use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Forward-mode dual number `val + eps·ε` with `ε² = 0`.
/// Evaluating `f` on `x + v·ε` yields `f(x) + (J(x) v)·ε`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }

    pub fn variable(val: f64) -> Self {
        Self::new(val, 1.0)
    }

    /// Applies a scalar function given its value and derivative at `val`.
    fn chain(self, value: f64, derivative: f64) -> Self {
        Self::new(value, derivative * self.eps)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / (rhs.val * rhs.val),
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // d/dx (x mod c) = 1 away from the jumps.
        Self::new(self.val % rhs.val, self.eps)
    }
}

macro_rules! assign_ops {
    ($($trait:ident::$method:ident => $op:tt),* $(,)?) => {
        $(
            impl $trait for Dual {
                fn $method(&mut self, rhs: Self) {
                    *self = *self $op rhs;
                }
            }
        )*
    };
}

assign_ops!(
    AddAssign::add_assign => +,
    SubAssign::sub_assign => -,
    MulAssign::mul_assign => *,
    DivAssign::div_assign => /,
    RemAssign::rem_assign => %,
);

impl Num for Dual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::constant)
            .map_err(|_| ())
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl Float for Dual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    // Classification looks at both parts so a blown-up derivative counts as
    // non-finite too.
    fn is_nan(self) -> bool {
        self.val.is_nan() || self.eps.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite() || self.eps.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite() && self.eps.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::constant(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.val.trunc())
    }
    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.eps)
    }
    fn abs(self) -> Self {
        self.chain(self.val.abs(), if self.val >= 0.0 { 1.0 } else { -1.0 })
    }
    fn signum(self) -> Self {
        Self::constant(self.val.signum())
    }
    fn is_sign_positive(self) -> bool {
        self.val.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.val.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }
    fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::one();
        }
        self.chain(self.val.powi(n), <f64 as From<i32>>::from(n) * self.val.powi(n - 1))
    }
    fn powf(self, n: Self) -> Self {
        // d(x^y) = x^y (y' ln x + y x'/x); skip the ln term for constant exponents.
        let value = self.val.powf(n.val);
        let mut eps = n.val * self.val.powf(n.val - 1.0) * self.eps;
        if n.eps != 0.0 {
            eps += value * self.val.ln() * n.eps;
        }
        Self::new(value, eps)
    }
    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }
    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }
    fn exp2(self) -> Self {
        let e = self.val.exp2();
        self.chain(e, e * std::f64::consts::LN_2)
    }
    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        self.chain(self.val.log2(), 1.0 / (self.val * std::f64::consts::LN_2))
    }
    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * std::f64::consts::LN_10))
    }
    fn max(self, other: Self) -> Self {
        if self.val >= other.val {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.val <= other.val {
            self
        } else {
            other
        }
    }
    fn abs_sub(self, other: Self) -> Self {
        if self.val > other.val {
            self - other
        } else {
            Self::zero()
        }
    }
    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        self.chain(c, 1.0 / (3.0 * c * c))
    }
    fn hypot(self, other: Self) -> Self {
        let h = self.val.hypot(other.val);
        Self::new(h, (self.val * self.eps + other.val * other.eps) / h)
    }
    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }
    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }
    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }
    fn atan2(self, other: Self) -> Self {
        let denom = self.val * self.val + other.val * other.val;
        Self::new(
            self.val.atan2(other.val),
            (other.val * self.eps - self.val * other.eps) / denom,
        )
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }
    fn exp_m1(self) -> Self {
        self.chain(self.val.exp_m1(), self.val.exp())
    }
    fn ln_1p(self) -> Self {
        self.chain(self.val.ln_1p(), 1.0 / (1.0 + self.val))
    }
    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }
    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }
    fn asinh(self) -> Self {
        self.chain(self.val.asinh(), 1.0 / (self.val * self.val + 1.0).sqrt())
    }
    fn acosh(self) -> Self {
        self.chain(self.val.acosh(), 1.0 / (self.val * self.val - 1.0).sqrt())
    }
    fn atanh(self) -> Self {
        self.chain(self.val.atanh(), 1.0 / (1.0 - self.val * self.val))
    }
    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

/// Jacobian of `system` at `(t, x)`, row-major, one dual evaluation per column.
pub fn jacobian<S>(system: &S, t: f64, x: &[f64]) -> Vec<f64>
where
    S: DynamicalSystem<Dual> + ?Sized,
{
    let n = x.len();
    let mut jac = vec![0.0; n * n];
    let mut dual_x: Vec<Dual> = x.iter().map(|&v| Dual::constant(v)).collect();
    let mut dual_out = vec![Dual::zero(); n];
    let t_dual = Dual::constant(t);

    for j in 0..n {
        dual_x[j].eps = 1.0;
        system.apply(t_dual, &dual_x, &mut dual_out);
        dual_x[j].eps = 0.0;
        for i in 0..n {
            jac[i * n + j] = dual_out[i].eps;
        }
    }
    jac
}

/// State augmented with an `n x n` tangent matrix `Φ` (row-major after the
/// first `n` entries).
///
/// For flows `Φ' = J(x) Φ`; for maps stepped with
/// [`DiscreteMap`](crate::solvers::DiscreteMap), `Φ_{k+1} = J(x_k) Φ_k`.
/// The same `apply` serves both.
pub struct TangentSystem<S> {
    pub inner: S,
    pub dimension: usize,
}

impl<S> TangentSystem<S> {
    pub fn new(inner: S, dim: usize) -> Self {
        Self {
            inner,
            dimension: dim,
        }
    }
}

impl<S> DynamicalSystem<f64> for TangentSystem<S>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    fn dimension(&self) -> usize {
        let n = self.dimension;
        n + n * n
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let n = self.dimension;
        let (base, phi) = x.split_at(n);
        let (base_out, phi_out) = out.split_at_mut(n);

        DynamicalSystem::<f64>::apply(&self.inner, t, base, base_out);
        let jac = jacobian(&self.inner, t, base);

        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += jac[i * n + k] * phi[k * n + j];
                }
                phi_out[i * n + j] = sum;
            }
        }
    }
}
