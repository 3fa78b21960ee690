use approx::assert_relative_eq;
use ivrs::simulation::{SimulatedIvData, SimulationConfig};
use ivrs::{
    CovarianceConfig, CovarianceOptions, CovarianceType, CueGmmEstimator, CueOptions, GmmEstimator,
    GmmOptions, IvError, IvEstimator, IvResults, KClassEstimator, LimlOptions, ModelData,
    ModelDataBuilder, ResultKind, WeightConfig,
};
use nalgebra::{DMatrix, DVector};

fn simulated(config: SimulationConfig) -> (SimulatedIvData, ModelData) {
    let sim = SimulatedIvData::generate(&config).unwrap();
    let data = sim.model_data().unwrap();
    (sim, data)
}

/// 2SLS and LIML recover the structural coefficients while OLS stays biased.
#[test]
fn iv_estimators_correct_endogeneity_bias() {
    let (sim, data) = simulated(SimulationConfig::default().with_noise(0.2));
    let robust = CovarianceOptions::new(CovarianceType::Robust);

    let tsls = KClassEstimator::two_stage(&data).fit(&robust).unwrap();
    let liml = KClassEstimator::liml(&data, LimlOptions::default())
        .fit(&robust)
        .unwrap();
    let ols = KClassEstimator::ols(&data).fit(&robust).unwrap();

    for results in [&tsls, &liml] {
        assert!((results.params[0] - sim.params[0]).abs() < 0.05, "{}", results.method);
        assert!((results.params[1] - sim.params[1]).abs() < 0.05, "{}", results.method);
        assert_eq!(results.kind, ResultKind::Iv);
    }
    assert!((ols.params[1] - sim.params[1]).abs() > 0.06);
    assert_eq!(ols.kind, ResultKind::Ols);

    assert_eq!(tsls.param_names, vec!["exog", "endog"]);
    assert_eq!(tsls.instrument_names, vec!["exog", "instruments.0", "instruments.1"]);
    assert!(tsls.f_statistic.is_valid());
    assert!(tsls.std_errors().iter().all(|se| se.is_finite() && *se > 0.0));

    let kclass = liml.kclass.as_ref().unwrap();
    assert!(kclass.kappa >= 1.0 - 1e-10);
    assert_eq!(kclass.liml_kappa, Some(kclass.kappa));
}

#[test]
fn exactly_identified_estimators_agree() {
    let (_, data) = simulated(SimulationConfig::default().with_n_instruments(1));
    let options = CovarianceOptions::default();

    let tsls = KClassEstimator::two_stage(&data).fit(&options).unwrap();
    let liml = KClassEstimator::liml(&data, LimlOptions::default())
        .fit(&options)
        .unwrap();
    let gmm = GmmEstimator::new(&data, CovarianceType::Robust, WeightConfig::default())
        .unwrap()
        .fit(&GmmOptions::default())
        .unwrap();

    assert_relative_eq!(liml.params, tsls.params, epsilon = 1e-6);
    assert_relative_eq!(gmm.params, tsls.params, epsilon = 1e-6);
    let j_stat = &gmm.gmm.as_ref().unwrap().j_stat;
    assert_eq!(j_stat.df, 0);
    assert!(j_stat.stat < 1e-8);
    assert!(j_stat.pval.is_nan());
}

#[test]
fn one_step_gmm_is_2sls_and_two_step_reports_j() {
    let (_, data) = simulated(
        SimulationConfig::default()
            .with_n_instruments(3)
            .with_heteroskedastic(true),
    );
    let gmm = GmmEstimator::new(&data, CovarianceType::Robust, WeightConfig::default()).unwrap();
    let one_step = gmm.fit(&GmmOptions::default().with_iter_limit(1)).unwrap();
    let tsls = KClassEstimator::two_stage(&data)
        .fit(&CovarianceOptions::default())
        .unwrap();
    assert_relative_eq!(one_step.params, tsls.params, epsilon = 1e-10);

    let two_step = gmm.fit(&GmmOptions::default()).unwrap();
    let diagnostics = two_step.gmm.as_ref().unwrap();
    assert_eq!(two_step.kind, ResultKind::Gmm);
    assert_eq!(diagnostics.j_stat.df, 2);
    assert!(diagnostics.j_stat.stat >= 0.0);
    assert!(diagnostics.j_stat.pval >= 0.0 && diagnostics.j_stat.pval <= 1.0);
    assert_eq!(diagnostics.weight_matrix.shape(), (4, 4));
    assert!(diagnostics.optimizer.is_none());
}

#[test]
fn cue_reports_optimizer_summary() {
    let (_, data) = simulated(
        SimulationConfig::default()
            .with_n_instruments(3)
            .with_heteroskedastic(true),
    );
    let results = CueGmmEstimator::new(&data, CovarianceType::Robust, WeightConfig::default())
        .unwrap()
        .fit(&CueOptions::default())
        .unwrap();
    assert_eq!(results.method, "IV-GMM-CUE");
    let diagnostics = results.gmm.as_ref().unwrap();
    let optimizer = diagnostics.optimizer.as_ref().unwrap();
    assert_relative_eq!(diagnostics.j_stat.stat, optimizer.objective, epsilon = 1e-8);
    assert!((results.params[1] - 1.5).abs() < 0.25);
}

#[test]
fn debiased_unadjusted_covariance_scales_by_dof() {
    let (_, data) = simulated(SimulationConfig::default());
    let estimator = KClassEstimator::two_stage(&data);
    let plain = estimator
        .fit(&CovarianceOptions::new(CovarianceType::Unadjusted))
        .unwrap();
    let debiased = estimator
        .fit(&CovarianceOptions::new(CovarianceType::Unadjusted).with_debiased(true))
        .unwrap();

    let n = data.nobs() as f64;
    let k = data.nvar() as f64;
    assert_relative_eq!(debiased.cov, &plain.cov * (n / (n - k)), epsilon = 1e-12);
    assert_relative_eq!(plain.s2, plain.residual_ss / n, epsilon = 1e-12);
    assert_eq!(plain.cov_estimator, "Unadjusted Covariance (Homoskedastic)");

    let f_test = debiased.f_statistic.as_valid().unwrap();
    assert_eq!(f_test.df_denom, Some(data.nobs() - data.nvar()));
}

#[test]
fn weighted_residual_identities() {
    let sim = SimulatedIvData::generate(&SimulationConfig::default()).unwrap();
    let data = sim.builder().weights(sim.random_weights(7)).build().unwrap();
    let results = KClassEstimator::two_stage(&data)
        .fit(&CovarianceOptions::default())
        .unwrap();

    assert_relative_eq!(data.weights().mean(), 1.0, epsilon = 1e-12);
    assert_relative_eq!(
        results.weighted_residuals,
        results.residuals.component_mul(data.sqrt_weights()),
        epsilon = 1e-10
    );
    assert_relative_eq!(
        results.residuals,
        data.dependent() - &results.fitted_values,
        epsilon = 1e-10
    );
    assert_relative_eq!(
        results.residual_ss,
        results.weighted_residuals.norm_squared(),
        epsilon = 1e-8
    );

    let estimator = KClassEstimator::two_stage(&data);
    let predicted = estimator
        .predict(&results.params, data.exog(), data.endog())
        .unwrap();
    assert_relative_eq!(predicted, results.fitted_values, epsilon = 1e-10);
}

#[test]
fn perfect_fit_has_unit_r2() {
    let n = 40;
    let exog = DMatrix::from_element(n, 1, 1.0);
    let instruments = DMatrix::from_fn(n, 2, |i, j| ((i * (j + 3)) % 7) as f64 + j as f64);
    let endog = DMatrix::from_fn(n, 1, |i, _| instruments[(i, 0)] + 0.5 * instruments[(i, 1)] + 0.1 * (i % 3) as f64);
    let y = DVector::from_fn(n, |i, _| 1.0 + 2.0 * endog[(i, 0)]);
    let data = ModelData::new(y, exog, endog, instruments).unwrap();
    let results = KClassEstimator::two_stage(&data)
        .fit(&CovarianceOptions::default())
        .unwrap();
    assert_relative_eq!(results.params, DVector::from_vec(vec![1.0, 2.0]), epsilon = 1e-8);
    assert_relative_eq!(results.r2, 1.0, epsilon = 1e-10);
}

#[test]
fn cluster_labels_follow_missing_rows() {
    let sim = SimulatedIvData::generate(&SimulationConfig::default().with_nobs(200)).unwrap();
    let mut dependent = sim.dependent.clone();
    dependent[3] = f64::NAN;
    dependent[150] = f64::NAN;
    let data = ModelDataBuilder::new(dependent)
        .exog(sim.exog.clone())
        .endog(sim.endog.clone())
        .instruments(sim.instruments.clone())
        .build()
        .unwrap();
    assert_eq!(data.nobs(), 198);
    assert_eq!(data.original_nobs(), 200);

    let all_rows: Vec<i64> = (0..200).map(|i| i / 10).collect();
    let clustered = |clusters: Vec<i64>| {
        CovarianceOptions::new(CovarianceType::Clustered)
            .with_config(CovarianceConfig::default().with_clusters(clusters))
    };
    let estimator = KClassEstimator::two_stage(&data);
    let full = estimator.fit(&clustered(all_rows.clone())).unwrap();

    let retained: Vec<i64> = data.index().iter().map(|&i| all_rows[i]).collect();
    let aligned = estimator.fit(&clustered(retained)).unwrap();
    assert_relative_eq!(full.cov, aligned.cov, epsilon = 1e-14);

    let wrong = estimator.fit(&clustered(vec![0; 50]));
    assert!(matches!(wrong, Err(IvError::DimensionMismatch { .. })));
}

#[test]
fn kernel_covariance_is_positive() {
    let (_, data) = simulated(SimulationConfig::default());
    let results = KClassEstimator::two_stage(&data)
        .fit(&CovarianceOptions::new(CovarianceType::Kernel))
        .unwrap();
    assert!(results.std_errors().iter().all(|se| se.is_finite() && *se > 0.0));
    assert_eq!(results.cov_type, CovarianceType::Kernel);
}

#[test]
fn invalid_models_are_rejected() {
    let sim = SimulatedIvData::generate(&SimulationConfig::default().with_nobs(50)).unwrap();

    let under = sim
        .builder()
        .endog(DMatrix::from_fn(50, 2, |i, j| sim.endog[(i, 0)] * (j as f64 + 1.0) + (i % (j + 2)) as f64))
        .instruments(sim.instruments.columns(0, 1).into_owned())
        .build();
    assert!(matches!(
        under,
        Err(IvError::UnderIdentified { instruments: 1, endogenous: 2 })
    ));

    let mut weights = DVector::from_element(50, 1.0);
    weights[4] = 0.0;
    assert!(matches!(
        sim.builder().weights(weights).build(),
        Err(IvError::NonPositiveWeight { index: 4, .. })
    ));

    let duplicated = DMatrix::from_fn(50, 2, |i, _| sim.instruments[(i, 0)]);
    assert!(matches!(
        sim.builder().instruments(duplicated).build(),
        Err(IvError::RankDeficient { .. })
    ));

    let missing = DVector::from_element(50, f64::NAN);
    assert!(matches!(
        ModelDataBuilder::new(missing).exog(sim.exog.clone()).build(),
        Err(IvError::AllRowsMissing)
    ));

    assert!(matches!(
        ModelDataBuilder::new(sim.dependent.clone()).build(),
        Err(IvError::NoRegressors)
    ));
}

#[test]
fn results_serialize_to_json() {
    let (_, data) = simulated(SimulationConfig::default());
    let results = KClassEstimator::liml(&data, LimlOptions::default().with_fuller(1.0))
        .fit(&CovarianceOptions::default())
        .unwrap();
    let json = serde_json::to_string(&results).unwrap();
    let restored: IvResults = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.method, results.method);
    assert_eq!(restored.param_names, results.param_names);
    assert_relative_eq!(restored.params, results.params, epsilon = 1e-12);
    assert_relative_eq!(restored.cov, results.cov, epsilon = 1e-12);
}
