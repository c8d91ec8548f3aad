use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value as Json;

use crate::{GraphError, Hwc};

/// Stable name under which graphs reference the corner-aligned resize.
pub const BILINEAR_RESIZE: &str = "bilinear_resize";

/// Builtin operations that custom operations lower to. Both interpreters and
/// the flat converter understand every primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Primitive {
    ResizeBilinear {
        /// Output `[height, width]`.
        size: [usize; 2],
        align_corners: bool,
        half_pixel_centers: bool,
    },
}

impl Primitive {
    pub fn output_hwc(&self, input: Hwc) -> Hwc {
        match self {
            Primitive::ResizeBilinear { size, .. } => Hwc {
                height: size[0],
                width: size[1],
                channels: input.channels,
            },
        }
    }
}

/// An operation outside the base layer set, referenced by name from `Lambda`
/// layers.
pub trait CustomOp: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Turn the layer's serialized arguments into a builtin primitive.
    fn lower(&self, arguments: &Json) -> Result<Primitive>;
}

/// Bilinear resize to a square `size x size` grid with corners aligned: the
/// outermost input and output pixels coincide exactly.
#[derive(Clone, Debug, Default)]
pub struct BilinearResize {
    fallback_size: Option<usize>,
}

impl BilinearResize {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size used when a layer was saved without a `size` argument.
    pub fn with_fallback_size(size: usize) -> Self {
        Self {
            fallback_size: Some(size),
        }
    }
}

impl CustomOp for BilinearResize {
    fn name(&self) -> &str {
        BILINEAR_RESIZE
    }

    fn lower(&self, arguments: &Json) -> Result<Primitive> {
        let size = match arguments.get("size") {
            Some(raw) => {
                let size = raw.as_u64().context("`size` must be a positive integer")?;
                usize::try_from(size).context("`size` does not fit in usize")?
            }
            None => self
                .fallback_size
                .context("missing `size` argument and no fallback size configured")?,
        };
        if size == 0 {
            bail!("`size` must be greater than zero");
        }
        Ok(Primitive::ResizeBilinear {
            size: [size, size],
            align_corners: true,
            half_pixel_centers: false,
        })
    }
}

/// Explicit set of custom operations handed to loaders and converters.
#[derive(Clone, Debug, Default)]
pub struct CustomOps {
    ops: BTreeMap<String, Arc<dyn CustomOp>>,
}

impl CustomOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// The set every slim-net style checkpoint needs.
    pub fn standard(resize_size: Option<usize>) -> Self {
        let resize = match resize_size {
            Some(size) => BilinearResize::with_fallback_size(size),
            None => BilinearResize::new(),
        };
        Self::new().with_op(resize)
    }

    pub fn with_op(mut self, op: impl CustomOp + 'static) -> Self {
        self.register(Arc::new(op));
        self
    }

    pub fn register(&mut self, op: Arc<dyn CustomOp>) {
        self.ops.insert(op.name().to_string(), op);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomOp>> {
        self.ops.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    pub fn resolve(&self, layer: &str, function: &str, arguments: &Json) -> Result<Primitive, GraphError> {
        let op = self
            .get(function)
            .ok_or_else(|| GraphError::UnresolvedOperation {
                layer: layer.to_string(),
                function: function.to_string(),
            })?;
        op.lower(arguments).map_err(|err| GraphError::InvalidConfig {
            layer: layer.to_string(),
            reason: format!("{err:#}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resize_lowers_with_corner_alignment() {
        let op = BilinearResize::new();
        let primitive = op.lower(&json!({ "size": 157 })).unwrap();
        assert_eq!(
            primitive,
            Primitive::ResizeBilinear {
                size: [157, 157],
                align_corners: true,
                half_pixel_centers: false,
            }
        );
    }

    #[test]
    fn resize_uses_fallback_only_when_size_missing() {
        let op = BilinearResize::with_fallback_size(64);
        let Primitive::ResizeBilinear { size, .. } = op.lower(&Json::Null).unwrap();
        assert_eq!(size, [64, 64]);

        let Primitive::ResizeBilinear { size, .. } = op.lower(&json!({ "size": 32 })).unwrap();
        assert_eq!(size, [32, 32]);
    }

    #[test]
    fn resize_rejects_bad_sizes() {
        let op = BilinearResize::new();
        assert!(op.lower(&json!({ "size": 0 })).is_err());
        assert!(op.lower(&json!({ "size": "big" })).is_err());
        assert!(op.lower(&json!({})).is_err());
    }

    #[test]
    fn unregistered_operation_is_unresolved() {
        let ops = CustomOps::new();
        let err = ops
            .resolve("resize", BILINEAR_RESIZE, &json!({ "size": 157 }))
            .unwrap_err();
        assert!(matches!(err, GraphError::UnresolvedOperation { .. }));
    }

    #[test]
    fn standard_set_contains_resize() {
        let ops = CustomOps::standard(None);
        assert_eq!(ops.names().collect::<Vec<_>>(), vec![BILINEAR_RESIZE]);
    }
}
