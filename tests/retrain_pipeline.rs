use microforest::{
    Base, Config, Dataset, Decode, Encode, EventLogger, Forest, HostProbe, NodePredictor,
    PackedVector, Quantizer, Sample,
};
use std::io::Write;
use test_log::test;

/// End-to-end: convert, auto-configure, train, persist, reload, infer
/// through the quantizer, then retrain after feedback.
#[test]
fn full_on_device_cycle() -> microforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut base = Base::new(dir.path(), "cycle")?;

    // Quantizer: two continuous features over [0, 8), 2 bits each
    let mut quantizer = Quantizer::new(2, 2);
    quantizer.set_feature_uniform(0, 0.0, 8.0);
    quantizer.set_feature_uniform(1, 0.0, 8.0);
    quantizer.store_label(0, "low");
    quantizer.store_label(1, "high");
    {
        let mut file = std::fs::File::create(base.quantizer_path())?;
        quantizer.encode_into(&mut file)?;
    }

    // Raw observations, pre-quantized into the initial CSV
    let raw: Vec<(u8, f32, f32)> = (0..40u16)
        .map(|i| {
            let x = f32::from(i % 8);
            let y = f32::from((i * 3) % 8);
            let label = u8::from(x >= 4.0);
            (label, x, y)
        })
        .collect();

    let csv_path = base.model_dir().join("cycle.csv");
    {
        let mut csv = std::fs::File::create(&csv_path)?;
        let mut bins = PackedVector::with_bits(2);
        for (label, x, y) in &raw {
            assert!(quantizer.quantize_features(&[*x, *y], &mut bins).is_none());
            writeln!(csv, "{label},{},{}", bins.get(0), bins.get(1))?;
        }
    }

    let mut data = Dataset::new(base.base_data_path(), 2, 2, 2)?;
    data.convert_from_csv(&csv_path)?;
    base.update_status();
    assert!(base.able_to_train());

    // No config file: everything derives from the dataset shape
    let mut config = Config::load(&base)?;
    assert!(config.enable_auto_config);

    let mut logger = EventLogger::new(&base, false)?;
    let anchor = logger.drop_anchor();

    data.load(true)?;
    let mut predictor = NodePredictor::new(&base);
    let mut forest = Forest::new();
    let score = forest.train(&mut data, &mut config, &mut predictor, &base)?;
    assert!(score > 0.5, "separable data should score well, got {score}");

    logger.log_duration("train", anchor);
    logger.log_memory("after train", &HostProbe);

    config.save(&mut base)?;
    forest.release(&base, &HostProbe)?;
    base.update_status();
    assert!(base.able_to_infer());

    // Fresh process: reload everything from disk
    let mut quantizer = {
        let mut file = std::fs::File::open(base.quantizer_path())?;
        Quantizer::decode_from(&mut file)?
    };
    assert_eq!(Some("high"), quantizer.label_text(1));

    let config = Config::load(&base)?;
    let mut forest = Forest::new();
    forest.load(&base, &config, &HostProbe)?;

    let mut bins = PackedVector::with_bits(2);
    let mut correct = 0usize;
    for (label, x, y) in &raw {
        assert!(quantizer.quantize_features(&[*x, *y], &mut bins).is_none());
        if forest.predict_features(&bins, config.num_labels) == *label {
            correct += 1;
        }
    }
    assert!(correct * 100 >= raw.len() * 90, "{correct}/{} correct", raw.len());

    // Feedback arrives out of range: record drift, widen, remap, append
    let drift = quantizer
        .quantize_features(&[9.5, 3.0], &mut bins)
        .expect("9.5 is beyond the declared range");
    assert_eq!(0, drift.feature);

    let filter = quantizer
        .apply_concept_drift_update(&[drift])
        .expect("update should apply");
    let (_, new_max) = quantizer.feature_range(0).expect("feature exists");
    assert!((new_max - 9.5).abs() < 1e-6);

    // Re-quantize the feedback with the widened ranges and append it
    assert!(quantizer.quantize_features(&[9.5, 3.0], &mut bins).is_none());
    let mut data = Dataset::new(base.base_data_path(), 2, 2, 2)?;
    data.set_update_filter(filter);
    data.add(
        &[Sample {
            label: 1,
            features: vec![bins.get(0) as u8, bins.get(1) as u8],
        }],
        0,
    )?;

    // The pending filter applies on the next load
    data.load(true)?;
    assert_eq!(41, data.len());

    // And a retrain on the refreshed dataset still works
    let mut config = Config::load(&base)?;
    let mut predictor = NodePredictor::new(&base);
    let mut forest = Forest::new();
    let score = forest.train(&mut data, &mut config, &mut predictor, &base)?;
    assert!(score > 0.0);

    Ok(())
}
