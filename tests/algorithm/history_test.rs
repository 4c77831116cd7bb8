use panel_match::{CovariateSpec, PanelMatcher, Qoi, RefinementMethod};

use crate::utils::{base_config, generated_panel, internal_id};

#[test]
fn test_no_missing_histories_are_identical() {
    let config = base_config().lag(3).use_parallel(false).build();
    let panel = generated_panel(&config, 120, 10);

    let result = PanelMatcher::new(config).run(&panel).unwrap();
    let att = result.att.expect("att sets requested");
    assert!(!att.is_empty());

    for set in &att {
        let treated = internal_id(&panel, &set.unit);
        for control in set.control_units() {
            let control = internal_id(&panel, control);
            for k in 1..=3 {
                let period = set.time - k;
                let own = panel.treatment(treated, period);
                assert!(own.is_some());
                assert_eq!(own, panel.treatment(control, period));
            }
            assert_eq!(panel.treatment(control, set.time), Some(0));
        }
    }
}

#[test]
fn test_match_missing_only_adds_candidates() {
    let strict = base_config().lag(3).use_parallel(false).build();
    let lenient = base_config().lag(3).match_missing(true).use_parallel(false).build();
    let panel = generated_panel(&strict, 150, 10);

    let strict = PanelMatcher::new(strict).run(&panel).unwrap().att.unwrap();
    let lenient = PanelMatcher::new(lenient).run(&panel).unwrap().att.unwrap();

    assert_eq!(strict.len(), lenient.len());
    let mut grew = false;
    for (s, l) in strict.iter().zip(lenient.iter()) {
        assert_eq!((&s.unit, s.time), (&l.unit, l.time));
        for control in s.control_units() {
            assert!(l.weight_of(control).is_some(), "{control} dropped under match-missing");
        }
        grew |= l.len() > s.len();
    }
    assert!(grew, "missing treatment cells should widen some matched sets");
}

#[test]
fn test_forbid_reversal_keeps_paths_constant() {
    let config = base_config()
        .lag(2)
        .lead([0, 1, 2])
        .forbid_treatment_reversal(true)
        .use_parallel(false)
        .build();
    let panel = generated_panel(&config, 100, 12);

    let att = PanelMatcher::new(config).run(&panel).unwrap().att.unwrap();
    assert!(!att.is_empty());

    for set in &att {
        let treated = internal_id(&panel, &set.unit);
        for f in 0..=2 {
            assert_eq!(panel.treatment(treated, set.time + f), Some(1));
            for control in set.control_units() {
                let control = internal_id(&panel, control);
                assert_eq!(panel.treatment(control, set.time + f), Some(0));
            }
        }
    }
}

#[test]
fn test_reverting_units_need_full_lead_window() {
    let allow = base_config().lag(2).lead([0, 1, 2]).use_parallel(false).build();
    let forbid = base_config()
        .lag(2)
        .lead([0, 1, 2])
        .forbid_treatment_reversal(true)
        .use_parallel(false)
        .build();
    let panel = generated_panel(&allow, 100, 12);

    let allow = PanelMatcher::new(allow).run(&panel).unwrap().att.unwrap();
    let forbid = PanelMatcher::new(forbid).run(&panel).unwrap().att.unwrap();

    // units that switch back off after two periods only qualify without the rule
    assert!(forbid.len() < allow.len());
    for set in &forbid {
        assert!(allow.get(&set.unit, set.time).is_some());
    }
}

#[test]
fn test_disabled_history_matching_uses_every_untreated_unit() {
    let config = base_config().lag(4).matching(false).use_parallel(false).build();
    let panel = generated_panel(&config, 40, 8);

    let att = PanelMatcher::new(config).run(&panel).unwrap().att.unwrap();
    assert_eq!(att.metadata.lag, 1);

    for set in &att {
        let treated = internal_id(&panel, &set.unit);
        let expected = panel
            .units()
            .filter(|&u| u != treated && panel.treatment(u, set.time) == Some(0))
            .count();
        assert_eq!(set.len(), expected);
    }
}

#[test]
fn test_parallel_and_sequential_runs_agree() {
    let covariates = CovariateSpec::parse("x1 + x2").unwrap();
    let sequential = base_config()
        .refinement_method(RefinementMethod::Mahalanobis)
        .covariates(covariates)
        .size_match(3)
        .qoi(Qoi::Ate)
        .use_parallel(false)
        .build();
    let mut parallel = sequential.clone();
    parallel.use_parallel = true;

    let panel = generated_panel(&sequential, 300, 12);
    let sequential = PanelMatcher::new(sequential).run(&panel).unwrap();
    let parallel = PanelMatcher::new(parallel).run(&panel).unwrap();

    assert!(sequential.att.as_ref().is_some_and(|att| att.len() >= 64));
    assert_eq!(sequential, parallel);
}
