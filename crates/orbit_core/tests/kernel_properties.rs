use orbit_core::equation_engine::EquationSystem;
use orbit_core::systems::{Henon, Lorenz96, Roessler};
use orbit_core::{
    DynamicalSystem, DynamicalSystemHandle, EvolutionError, EvolutionRule, IntegrationMethod,
    IntegratorConfig, ParamKey, Parameters, SystemKind, TrajectoryOptions,
};
use proptest::prelude::*;

fn henon_rule() -> EvolutionRule<Parameters> {
    EvolutionRule::map(|x: &[f64], p: &Parameters, _t| {
        vec![1.0 - p[0] * x[0] * x[0] + x[1], p[1] * x[0]]
    })
}

fn henon_params() -> Parameters {
    Parameters::new([("a", 1.4), ("b", 0.3)]).unwrap()
}

#[test]
fn henon_scenario() {
    let mut ds = DynamicalSystemHandle::discrete(henon_rule(), vec![0.2, 0.3], henon_params())
        .unwrap();
    let tr = ds.trajectory(2.0, &TrajectoryOptions::default()).unwrap();
    assert_eq!(tr.len(), 3);
    assert_eq!(tr.times, vec![0.0, 1.0, 2.0]);
    assert_eq!(tr.states.point(0).unwrap(), &[0.2, 0.3]);
    let x1 = tr.states.point(1).unwrap();
    assert!((x1[0] - 1.244).abs() < 1e-12);
    assert!((x1[1] - 0.06).abs() < 1e-12);
    let x2 = tr.states.point(2).unwrap();
    assert!((x2[0] + 1.1065504).abs() < 1e-12);
    assert!((x2[1] - 0.3732).abs() < 1e-12);

    let before = ds.current_state();
    let err = ds.set_parameter("c", 2.0).unwrap_err();
    assert!(matches!(err, EvolutionError::UnknownParameter { .. }));
    assert_eq!(ds.current_state(), before);
    assert_eq!(ds.current_time(), 2.0);

    ds.set_parameter("a", 1.0).unwrap();
    assert_eq!(ds.parameters().get("a"), Some(1.0));
    ds.set_parameter(ParamKey::Index(1), 0.5).unwrap();
    assert_eq!(ds.parameters().values(), &[1.0, 0.5]);
}

#[test]
fn in_place_and_out_of_place_rules_agree() {
    let in_place = EvolutionRule::in_place(
        SystemKind::Map,
        |out: &mut [f64], x: &[f64], p: &Parameters, _t| {
            out[0] = 1.0 - p[0] * x[0] * x[0] + x[1];
            out[1] = p[1] * x[0];
        },
    );
    let mut a = DynamicalSystemHandle::discrete(henon_rule(), vec![0.1, 0.1], henon_params())
        .unwrap();
    let mut b =
        DynamicalSystemHandle::discrete(in_place, vec![0.1, 0.1], henon_params()).unwrap();
    let ta = a.trajectory(200.0, &TrajectoryOptions::default()).unwrap();
    let tb = b.trajectory(200.0, &TrajectoryOptions::default()).unwrap();
    assert_eq!(ta, tb);
}

#[test]
fn nan_on_third_step_is_reported_with_prefix() {
    let rule = EvolutionRule::map(|x: &[f64], _p: &(), t: f64| {
        if t < 2.0 {
            vec![x[0] + 1.0]
        } else {
            vec![f64::NAN]
        }
    });
    let mut ds = DynamicalSystemHandle::discrete(rule, vec![0.0], ()).unwrap();
    let err = ds.trajectory(5.0, &TrajectoryOptions::default()).unwrap_err();
    assert_eq!(err.last_index, Some(2));
    assert_eq!(err.partial.len(), 3);
    assert!(matches!(err.error, EvolutionError::Diverged { .. }));
    assert!(ds.is_diverged());
    assert_eq!(ds.current_state(), vec![2.0]);
    assert!(matches!(ds.step(), Err(EvolutionError::Diverged { .. })));
}

#[test]
fn lorenz96_trajectory_through_handle() {
    let system = Lorenz96::new(5, 8.0).unwrap();
    let mut u0 = vec![8.0; 5];
    u0[0] += 0.01;
    let mut ds = DynamicalSystemHandle::from_system(
        SystemKind::Flow,
        system,
        u0,
        Some(IntegratorConfig::default()),
    )
    .unwrap();
    let options = TrajectoryOptions::default()
        .with_transient(5.0)
        .with_sampling_interval(0.05);
    let tr = ds.trajectory(15.0, &options).unwrap();
    assert_eq!(tr.len(), 201);
    assert_eq!(tr.states.dimension(), 5);
    assert!((tr.times[0] - 5.0).abs() < 1e-12);
    assert!((tr.times[200] - 15.0).abs() < 1e-9);
    assert!(tr.states.iter().flatten().all(|v| v.is_finite()));
}

#[test]
fn fixed_rk4_matches_adaptive_tsit5_on_roessler() {
    let run = |config: IntegratorConfig| {
        let mut ds = DynamicalSystemHandle::from_system(
            SystemKind::Flow,
            Roessler::default(),
            vec![1.0, 1.0, 0.0],
            Some(config),
        )
        .unwrap();
        ds.step_until(5.0).unwrap();
        ds.current_state()
    };
    let fixed = run(IntegratorConfig::fixed(IntegrationMethod::Rk4, 1e-3));
    let adaptive = run(IntegratorConfig::adaptive(1e-10, 1e-10));
    for (a, b) in fixed.iter().zip(&adaptive) {
        assert!((a - b).abs() < 1e-6, "{fixed:?} vs {adaptive:?}");
    }
}

fn lorenz96_equations(n: usize) -> EquationSystem<f64> {
    let names: Vec<String> = (0..n).map(|i| format!("x{i}")).collect();
    let equations: Vec<String> = (0..n)
        .map(|i| {
            format!(
                "(x{} - x{}) * x{} - x{} + F",
                (i + 1) % n,
                (i + n - 2) % n,
                (i + n - 1) % n,
                i
            )
        })
        .collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let equations: Vec<&str> = equations.iter().map(String::as_str).collect();
    EquationSystem::compile(&names, &["F"], &equations, vec![8.0]).unwrap()
}

proptest! {
    #[test]
    fn split_stepping_matches_single_run(
        x in -0.5f64..0.5,
        y in -0.5f64..0.5,
        n in 0usize..40,
        m in 0usize..40,
    ) {
        let mut split =
            DynamicalSystemHandle::discrete(henon_rule(), vec![x, y], henon_params()).unwrap();
        let mut whole = split.clone();
        let split_result = split.step_n(n).and_then(|_| split.step_n(m));
        let whole_result = whole.step_n(n + m);
        prop_assert_eq!(split_result, whole_result);
        prop_assert_eq!(split.current_state(), whole.current_state());
        prop_assert_eq!(split.current_time(), whole.current_time());
    }

    #[test]
    fn trajectory_matches_manual_stepping(
        transient in 0u32..20,
        interval in 1u32..5,
        extra in 0u32..40,
    ) {
        let horizon = f64::from(transient + extra);
        let options = TrajectoryOptions::default()
            .with_transient(f64::from(transient))
            .with_sampling_interval(f64::from(interval));
        let mut recorder = DynamicalSystemHandle::from_system(
            SystemKind::Map,
            Henon::default(),
            vec![0.0, 0.0],
            None,
        )
        .unwrap();
        let mut manual = recorder.clone();

        let tr = recorder.trajectory(horizon, &options).unwrap();
        prop_assert_eq!(tr.len(), (extra / interval) as usize + 1);

        manual.step_n(transient as usize).unwrap();
        for (k, (t, point)) in tr.iter().enumerate() {
            if k > 0 {
                manual.step_n(interval as usize).unwrap();
            }
            let current = manual.current_state();
            prop_assert_eq!(t, manual.current_time());
            prop_assert_eq!(point, current.as_slice());
        }
        prop_assert_eq!(recorder.current_state(), manual.current_state());
    }

    #[test]
    fn compiled_equations_match_typed_systems(
        a in -10.0f64..10.0,
        b in -10.0f64..10.0,
        c in -10.0f64..10.0,
        d in -10.0f64..10.0,
    ) {
        let x = [a, b, c, d];
        let typed = Lorenz96::new(4, 8.0).unwrap();
        let compiled = lorenz96_equations(4);
        let mut expected = [0.0; 4];
        let mut got = [0.0; 4];
        DynamicalSystem::<f64>::apply(&typed, 0.0, &x, &mut expected);
        DynamicalSystem::<f64>::apply(&compiled, 0.0, &x, &mut got);
        for (e, g) in expected.iter().zip(&got) {
            prop_assert!((e - g).abs() <= 1e-12 * e.abs().max(1.0));
        }

        let typed = Roessler::default();
        let compiled = EquationSystem::compile(
            &["x", "y", "z"],
            &["a", "b", "c"],
            &["-y - z", "x + a * y", "b + z * (x - c)"],
            vec![0.2, 0.2, 5.7],
        )
        .unwrap();
        let mut expected = [0.0; 3];
        let mut got = [0.0; 3];
        DynamicalSystem::<f64>::apply(&typed, 0.0, &x[..3], &mut expected);
        DynamicalSystem::<f64>::apply(&compiled, 0.0, &x[..3], &mut got);
        for (e, g) in expected.iter().zip(&got) {
            prop_assert!((e - g).abs() <= 1e-12 * e.abs().max(1.0));
        }
    }
}
