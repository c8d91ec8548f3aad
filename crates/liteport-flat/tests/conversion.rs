use liteport_checkpoint::{fixtures, save_intermediate, GraphModel};
use liteport_core::{
    ConversionError, CustomOps, Encoding, InferenceModel, ModelArtifact, ModelLoader,
};
use liteport_flat::{
    BuiltinOp, Converter, ConverterOptions, FlatInterpreter, FlatLoader, FlatModel, OpOptions,
    Quantize,
};
use tempfile::TempDir;

fn converter(quantize: Quantize) -> Converter {
    Converter::new(
        CustomOps::standard(None),
        ConverterOptions {
            quantize,
            ..ConverterOptions::default()
        },
    )
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).fold(0.0, |m, (x, y)| m.max((x - y).abs()))
}

#[test]
fn resize_lowers_to_single_aligned_builtin() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("resize.intermediate");
    save_intermediate(&fixtures::resize_net(157), &path)?;

    let flat = FlatModel::parse(converter(Quantize::None).convert_file(&path)?)?;
    assert_eq!(flat.operators.len(), 1);
    let op = &flat.operators[0];
    assert_eq!(flat.opcode(op)?, BuiltinOp::ResizeBilinear);
    assert_eq!(
        op.options,
        OpOptions::ResizeBilinear {
            align_corners: true,
            half_pixel_centers: false,
        }
    );
    let size = flat.constant(op.inputs[1])?.expect("size is constant");
    assert_eq!(size.to_i32()?, vec![157, 157]);
    assert_eq!(flat.tensor(flat.outputs[0])?.shape, vec![1, 157, 157, 3]);
    Ok(())
}

#[test]
fn flat_model_reproduces_graph_outputs() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let model = fixtures::slim_net();
    let path = dir.path().join("slim.intermediate");
    save_intermediate(&model, &path)?;

    let flat_path = dir.path().join("slim.lpfb");
    std::fs::write(&flat_path, converter(Quantize::None).convert_file(&path)?)?;

    let ops = CustomOps::standard(None);
    let mut reference = GraphModel::new(&model, &ops)?;
    let mut converted = FlatLoader::new().load(&ModelArtifact::FlatPath(flat_path), &ops)?;
    assert_eq!(reference.spec(), converted.spec());

    for seed in 0..3 {
        let input = reference.spec().inputs[0].probe(2, seed)?;
        let expected = reference.infer(vec![input.clone()])?;
        let actual = converted.infer(vec![input])?;
        assert_eq!(actual[0].shape, expected[0].shape);
        // same kernels in the same order
        assert_eq!(actual[0].to_f32()?, expected[0].to_f32()?);
    }
    Ok(())
}

#[test]
fn int8_weights_stay_close_to_reference() -> anyhow::Result<()> {
    let model = fixtures::slim_net();
    let ops = CustomOps::standard(None);
    let flat = converter(Quantize::Int8Weights).convert_model(&model)?;
    assert_eq!(flat.metadata_value("weight_quantization"), Some("int8-weights"));
    let kernel = flat
        .tensors
        .iter()
        .find(|t| t.name == "stem/kernel")
        .expect("stem kernel");
    assert!(kernel.quantization.is_some());

    let mut reference = GraphModel::new(&model, &ops)?;
    let mut converted = FlatInterpreter::new(FlatModel::parse(flat.to_bytes())?)?;
    let input = reference.spec().inputs[0].probe(1, 11)?;
    let expected = reference.infer(vec![input.clone()])?[0].to_f32()?;
    let actual = converted.infer(vec![input])?[0].to_f32()?;
    assert!(max_abs_diff(&expected, &actual) < 0.05);
    Ok(())
}

#[test]
fn conversion_is_byte_identical_across_runs() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("slim.intermediate");
    save_intermediate(&fixtures::slim_net(), &path)?;

    let first = converter(Quantize::None).convert_file(&path)?;
    let second = converter(Quantize::None).convert_file(&path)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn checkpoint_input_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = fixtures::write_checkpoint(dir.path(), "slim.ckpt", &fixtures::slim_net())?;

    let err = converter(Quantize::None).convert_file(&path).unwrap_err();
    assert!(matches!(
        err,
        ConversionError::UnexpectedEncoding {
            expected: Encoding::Intermediate,
            found: Encoding::Checkpoint,
            ..
        }
    ));
    Ok(())
}

#[test]
fn flat_input_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("resize.lpfb");
    let bytes = converter(Quantize::None).convert_model(&fixtures::resize_net(4))?.to_bytes();
    std::fs::write(&path, bytes)?;

    let err = converter(Quantize::None).convert_file(&path).unwrap_err();
    assert!(matches!(
        err,
        ConversionError::UnexpectedEncoding {
            found: Encoding::Flat,
            ..
        }
    ));
    Ok(())
}

#[test]
fn missing_intermediate_is_an_input_error() {
    let dir = TempDir::new().unwrap();
    let err = converter(Quantize::None)
        .convert_file(&dir.path().join("absent.intermediate"))
        .unwrap_err();
    assert!(matches!(err, ConversionError::Input(_)));
}
