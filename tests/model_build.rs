//! End-to-end builds of the public network surface.

use tch::{nn::VarStore, Device, Kind, Tensor};

use sngan_rs::{
    ConfigError, Discriminator, DiscriminatorConfig, Generator, GeneratorConfig, HeadType,
    Resample,
};

#[test]
fn two_down_blocks_with_plain_head() {
    // block_sizes (64, 64), resamples (DOWN, SAME), unconditional head:
    // two residual blocks feeding a single scalar score, labels unused
    let config = DiscriminatorConfig {
        image_shape: (3, 32, 32),
        block_sizes: vec![64, 64],
        resamples: vec![Resample::Down, Resample::Same],
        head: HeadType::Unconditional,
        ..Default::default()
    };
    let vs = VarStore::new(Device::Cpu);
    let disc = Discriminator::new(&vs.root(), &config).unwrap();
    assert_eq!(disc.num_blocks(), 2);
    assert_eq!(disc.num_outputs(), 1);

    let images = Tensor::randn([4, 3, 32, 32], (Kind::Float, Device::Cpu));
    let labels_a = Tensor::from_slice(&[0i64, 1, 2, 3]);
    let labels_b = Tensor::from_slice(&[9i64, 8, 7, 6]);
    let out_a = disc.forward_t(&images, &labels_a, false);
    let out_b = disc.forward_t(&images, &labels_b, false);
    assert_eq!(out_a.score.size(), vec![4, 1]);
    // nothing in this configuration consumes the labels
    assert!(out_a.score.equal(&out_b.score));
}

#[test]
fn head_output_arity() {
    let cases = [
        (HeadType::AcGan, 2),
        (HeadType::Projective, 1),
        (HeadType::Unconditional, 1),
        (HeadType::Conditional, 1),
    ];
    for (head, expected) in cases {
        let config = DiscriminatorConfig {
            image_shape: (3, 16, 16),
            block_sizes: vec![32, 32],
            resamples: vec![Resample::Down, Resample::Same],
            head,
            ..Default::default()
        };
        let vs = VarStore::new(Device::Cpu);
        let disc = Discriminator::new(&vs.root(), &config).unwrap();
        assert_eq!(disc.num_outputs(), expected);

        let images = Tensor::randn([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[1i64, 4]);
        let outputs = disc.forward_t(&images, &labels, true).into_vec();
        assert_eq!(outputs.len(), expected);
    }
}

#[test]
fn validation_failures_abort_before_building() {
    let vs = VarStore::new(Device::Cpu);
    let config = DiscriminatorConfig {
        block_sizes: vec![64],
        resamples: vec![Resample::Down, Resample::Same],
        ..Default::default()
    };
    assert_eq!(
        Discriminator::new(&vs.root(), &config).unwrap_err(),
        ConfigError::BlockResampleMismatch { blocks: 1, resamples: 2 }
    );
    assert!(vs.variables().is_empty());

    let config = DiscriminatorConfig {
        conditional_shortcut: false,
        unconditional_shortcut: false,
        ..Default::default()
    };
    assert_eq!(
        Discriminator::new(&vs.root(), &config).unwrap_err(),
        ConfigError::ShortcutsDisabled
    );
    assert!(vs.variables().is_empty());
}

#[test]
fn repeated_builds_have_identical_structure() {
    let config = DiscriminatorConfig {
        image_shape: (3, 16, 16),
        block_sizes: vec![32, 64],
        resamples: vec![Resample::Down, Resample::Down],
        spectral: true,
        ..Default::default()
    };
    let vs_a = VarStore::new(Device::Cpu);
    let vs_b = VarStore::new(Device::Cpu);
    Discriminator::new(&vs_a.root(), &config).unwrap();
    Discriminator::new(&vs_b.root(), &config).unwrap();

    let mut names_a: Vec<String> = vs_a.variables().keys().cloned().collect();
    let mut names_b: Vec<String> = vs_b.variables().keys().cloned().collect();
    names_a.sort();
    names_b.sort();
    assert_eq!(names_a, names_b);
    assert_eq!(vs_a.trainable_variables().len(), vs_b.trainable_variables().len());
}

#[test]
fn generator_and_discriminator_round_trip() {
    let g_config = GeneratorConfig {
        latent_dim: 32,
        base_size: (4, 4),
        block_sizes: vec![64, 32],
        resamples: vec![Resample::Up, Resample::Up],
        ..Default::default()
    };
    let d_config = DiscriminatorConfig {
        image_shape: (3, 16, 16),
        block_sizes: vec![32, 64],
        resamples: vec![Resample::Down, Resample::Same],
        head: HeadType::Projective,
        ..Default::default()
    };

    let g_vs = VarStore::new(Device::Cpu);
    let d_vs = VarStore::new(Device::Cpu);
    let generator = Generator::new(&g_vs.root(), &g_config).unwrap();
    let discriminator = Discriminator::new(&d_vs.root(), &d_config).unwrap();

    let latent = Tensor::randn([2, 32], (Kind::Float, Device::Cpu));
    let labels = Tensor::from_slice(&[2i64, 5]);
    let fake = generator.forward_t(&latent, &labels, true);
    assert_eq!(fake.size(), vec![2, 3, 16, 16]);

    let out = discriminator.forward_t(&fake, &labels, true);
    assert_eq!(out.score.size(), vec![2, 1]);
}
