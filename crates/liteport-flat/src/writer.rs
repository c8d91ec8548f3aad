use bytes::{BufMut, Bytes, BytesMut};
use liteport_core::FLAT_MAGIC;

use crate::schema::{dtype_tag, padding_tag, FlatModel, OpOptions, BUFFER_ALIGNMENT};

fn align(offset: usize) -> usize {
    offset.div_ceil(BUFFER_ALIGNMENT) * BUFFER_ALIGNMENT
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_indices(buf: &mut BytesMut, indices: &[i32]) {
    buf.put_u32_le(indices.len() as u32);
    for index in indices {
        buf.put_i32_le(*index);
    }
}

fn put_options(buf: &mut BytesMut, options: &OpOptions) {
    match *options {
        OpOptions::None => buf.put_u8(0),
        OpOptions::Conv2d {
            padding,
            stride_h,
            stride_w,
            activation,
        } => {
            buf.put_u8(1);
            buf.put_u8(padding_tag(padding));
            buf.put_u32_le(stride_h);
            buf.put_u32_le(stride_w);
            buf.put_u8(activation.tag());
        }
        OpOptions::DepthwiseConv2d {
            padding,
            stride_h,
            stride_w,
            depth_multiplier,
            activation,
        } => {
            buf.put_u8(2);
            buf.put_u8(padding_tag(padding));
            buf.put_u32_le(stride_h);
            buf.put_u32_le(stride_w);
            buf.put_u32_le(depth_multiplier);
            buf.put_u8(activation.tag());
        }
        OpOptions::Pool2d {
            padding,
            stride_h,
            stride_w,
            filter_h,
            filter_w,
            activation,
        } => {
            buf.put_u8(3);
            buf.put_u8(padding_tag(padding));
            buf.put_u32_le(stride_h);
            buf.put_u32_le(stride_w);
            buf.put_u32_le(filter_h);
            buf.put_u32_le(filter_w);
            buf.put_u8(activation.tag());
        }
        OpOptions::Concatenation { axis, activation } => {
            buf.put_u8(4);
            buf.put_i32_le(axis);
            buf.put_u8(activation.tag());
        }
        OpOptions::Add { activation } => {
            buf.put_u8(5);
            buf.put_u8(activation.tag());
        }
        OpOptions::ResizeBilinear {
            align_corners,
            half_pixel_centers,
        } => {
            buf.put_u8(6);
            buf.put_u8(align_corners as u8);
            buf.put_u8(half_pixel_centers as u8);
        }
        OpOptions::BatchNorm { epsilon } => {
            buf.put_u8(7);
            buf.put_f32_le(epsilon);
        }
    }
}

impl FlatModel {
    /// Serialize to the on-disk layout. Output depends only on the model
    /// contents, so equal models encode to equal bytes. Dimensions are
    /// stored as u32; [`crate::Converter`] rejects models that exceed it.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4096 + self.constant_bytes());
        buf.put_slice(&FLAT_MAGIC);
        buf.put_u32_le(self.version);
        put_str(&mut buf, &self.description);

        buf.put_u32_le(self.metadata.len() as u32);
        for (key, value) in &self.metadata {
            put_str(&mut buf, key);
            put_str(&mut buf, value);
        }

        buf.put_u32_le(self.operator_codes.len() as u32);
        for op in &self.operator_codes {
            buf.put_u32_le(op.code());
        }

        buf.put_u32_le(self.tensors.len() as u32);
        for tensor in &self.tensors {
            put_str(&mut buf, &tensor.name);
            buf.put_u8(dtype_tag(tensor.dtype));
            buf.put_u32_le(tensor.shape.len() as u32);
            for dim in &tensor.shape {
                buf.put_u32_le(*dim as u32);
            }
            buf.put_u32_le(tensor.buffer);
            match tensor.quantization {
                Some(q) => {
                    buf.put_u8(1);
                    buf.put_f32_le(q.scale);
                    buf.put_i32_le(q.zero_point);
                }
                None => buf.put_u8(0),
            }
        }

        buf.put_u32_le(self.operators.len() as u32);
        for op in &self.operators {
            buf.put_u32_le(op.opcode_index);
            put_indices(&mut buf, &op.inputs);
            put_indices(&mut buf, &op.outputs);
            put_options(&mut buf, &op.options);
        }

        put_indices(&mut buf, &self.inputs);
        put_indices(&mut buf, &self.outputs);

        let mut offsets = Vec::with_capacity(self.buffers.len());
        let mut end = 0usize;
        for buffer in &self.buffers {
            let offset = align(end);
            offsets.push(offset);
            end = offset + buffer.len();
        }
        buf.put_u32_le(self.buffers.len() as u32);
        for (offset, buffer) in offsets.iter().zip(&self.buffers) {
            buf.put_u64_le(*offset as u64);
            buf.put_u64_le(buffer.len() as u64);
        }

        let data_start = align(buf.len());
        buf.put_bytes(0, data_start - buf.len());
        for (offset, buffer) in offsets.iter().zip(&self.buffers) {
            let pad = data_start + offset - buf.len();
            buf.put_bytes(0, pad);
            buf.put_slice(buffer);
        }

        buf.freeze()
    }
}
