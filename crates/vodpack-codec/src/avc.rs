//! H.264/AVC parameter sets and slice header sizing.
//!
//! Only the fields that influence the length of a slice header are kept.
//! Everything else is parsed and discarded so the reader stays aligned.

use std::borrow::Cow;

use tracing::debug;

use crate::bits::{ceil_log2, BitReader};
use crate::error::{CodecError, Result};
use crate::nal::{self, avc};

const MAX_SPS_COUNT: u32 = 32;
const MAX_PPS_COUNT: u32 = 256;
const EXTENDED_SAR: u32 = 255;

const SLICE_P: u32 = 0;
const SLICE_B: u32 = 1;
const SLICE_I: u32 = 2;
const SLICE_SP: u32 = 3;
const SLICE_SI: u32 = 4;

#[derive(Debug, Clone, Default)]
struct Sps {
    pic_width_in_mbs: u32,
    pic_height_in_map_units: u32,
    transfer_characteristics: u8,
    frame_mbs_only: bool,
    pic_order_cnt_type: u32,
    delta_pic_order_always_zero: bool,
    log2_max_pic_order_cnt_lsb: u32,
    log2_max_frame_num: u32,
    chroma_format_idc: u32,
    chroma_array_type: u32,
    separate_colour_plane: bool,
}

#[derive(Debug, Clone, Default)]
struct Pps {
    sps_id: usize,
    entropy_coding_mode: bool,
    bottom_field_pic_order_in_frame_present: bool,
    num_slice_groups_minus1: u32,
    slice_group_map_type: u32,
    slice_group_change_rate: u32,
    num_ref_idx: [u32; 2],
    weighted_pred: bool,
    weighted_bipred_idc: u32,
    deblocking_filter_control_present: bool,
    redundant_pic_cnt_present: bool,
}

/// Parameter-set state for measuring AVC slice headers
#[derive(Debug, Clone, Default)]
pub struct AvcParser {
    sps: Vec<Option<Sps>>,
    pps: Vec<Option<Pps>>,
}

fn store<T>(table: &mut Vec<Option<T>>, id: usize, value: T) {
    if table.len() <= id {
        table.resize_with(id + 1, || None);
    }
    table[id] = Some(value);
}

fn skip_hrd_parameters(reader: &mut BitReader<'_>) -> Result<()> {
    let cpb_cnt_minus1 = reader.read_ue()?;
    reader.skip_bits(4)?; // bit_rate_scale
    reader.skip_bits(4)?; // cpb_size_scale
    for _ in 0..=cpb_cnt_minus1 {
        reader.skip_exp_golomb()?; // bit_rate_value_minus1
        reader.skip_exp_golomb()?; // cpb_size_value_minus1
        reader.read_bit()?; // cbr_flag
    }
    reader.skip_bits(5)?; // initial_cpb_removal_delay_length_minus1
    reader.skip_bits(5)?; // cpb_removal_delay_length_minus1
    reader.skip_bits(5)?; // dpb_output_delay_length_minus1
    reader.skip_bits(5)?; // time_offset_length
    Ok(())
}

fn parse_vui_parameters(sps: &mut Sps, reader: &mut BitReader<'_>) -> Result<()> {
    if reader.read_bit()? {
        // aspect_ratio_info_present_flag
        let aspect_ratio_idc = reader.read_bits(8)?;
        if aspect_ratio_idc == EXTENDED_SAR {
            reader.skip_bits(16)?; // sar_width
            reader.skip_bits(16)?; // sar_height
        }
    }
    if reader.read_bit()? {
        reader.read_bit()?; // overscan_appropriate_flag
    }
    if reader.read_bit()? {
        // video_signal_type_present_flag
        reader.skip_bits(3)?; // video_format
        reader.read_bit()?; // video_full_range_flag
        if reader.read_bit()? {
            reader.skip_bits(8)?; // colour_primaries
            sps.transfer_characteristics = reader.read_bits(8)? as u8;
            reader.skip_bits(8)?; // matrix_coefficients
        }
    }
    if reader.read_bit()? {
        // chroma_loc_info_present_flag
        reader.skip_exp_golomb()?;
        reader.skip_exp_golomb()?;
    }
    if reader.read_bit()? {
        // timing_info_present_flag
        reader.skip_bits(32)?; // num_units_in_tick
        reader.skip_bits(32)?; // time_scale
        reader.read_bit()?; // fixed_frame_rate_flag
    }
    let nal_hrd = reader.read_bit()?;
    if nal_hrd {
        skip_hrd_parameters(reader)?;
    }
    let vcl_hrd = reader.read_bit()?;
    if vcl_hrd {
        skip_hrd_parameters(reader)?;
    }
    if nal_hrd || vcl_hrd {
        reader.read_bit()?; // low_delay_hrd_flag
    }
    reader.read_bit()?; // pic_struct_present_flag
    if reader.read_bit()? {
        // bitstream_restriction_flag
        reader.read_bit()?; // motion_vectors_over_pic_boundaries_flag
        for _ in 0..6 {
            // max_bytes_per_pic_denom .. max_dec_frame_buffering
            reader.skip_exp_golomb()?;
        }
    }
    Ok(())
}

fn skip_scaling_list(reader: &mut BitReader<'_>, size: usize) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = reader.read_se()?;
            next_scale = (last_scale + delta_scale) & 0xff;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

fn skip_scaling_matrix(reader: &mut BitReader<'_>, count: u32) -> Result<()> {
    for i in 0..count {
        if reader.read_bit()? {
            skip_scaling_list(reader, if i < 6 { 16 } else { 64 })?;
        }
    }
    Ok(())
}

fn skip_ref_pic_list_modification(reader: &mut BitReader<'_>, slice_type: u32, mvc: bool) -> Result<()> {
    let lists = match slice_type {
        SLICE_I | SLICE_SI => 0,
        SLICE_B => 2,
        _ => 1,
    };

    for _ in 0..lists {
        if !reader.read_bit()? {
            // ref_pic_list_modification_flag_lX
            continue;
        }
        loop {
            let modification_of_pic_nums_idc = reader.read_ue()?;
            match modification_of_pic_nums_idc {
                0 | 1 => reader.skip_exp_golomb()?, // abs_diff_pic_num_minus1
                2 => reader.skip_exp_golomb()?,     // long_term_pic_num
                4 | 5 if mvc => reader.skip_exp_golomb()?, // abs_diff_view_idx_minus1
                3 => break,
                _ => {}
            }
        }
    }
    Ok(())
}

fn skip_pred_weight_table(
    reader: &mut BitReader<'_>,
    slice_type: u32,
    num_ref_idx: [u32; 2],
    chroma_array_type: u32,
) -> Result<()> {
    reader.skip_exp_golomb()?; // luma_log2_weight_denom
    if chroma_array_type != 0 {
        reader.skip_exp_golomb()?; // chroma_log2_weight_denom
    }

    let lists = if slice_type == SLICE_B { 2 } else { 1 };
    for &count in &num_ref_idx[..lists] {
        for _ in 0..count {
            if reader.read_bit()? {
                reader.skip_exp_golomb()?; // luma_weight
                reader.skip_exp_golomb()?; // luma_offset
            }
            if chroma_array_type != 0 && reader.read_bit()? {
                for _ in 0..4 {
                    reader.skip_exp_golomb()?; // chroma_weight, chroma_offset
                }
            }
        }
    }
    Ok(())
}

fn skip_dec_ref_pic_marking(reader: &mut BitReader<'_>, nal_unit_type: u8) -> Result<()> {
    if nal_unit_type == avc::IDR_SLICE {
        reader.read_bit()?; // no_output_of_prior_pics_flag
        reader.read_bit()?; // long_term_reference_flag
        return Ok(());
    }

    if !reader.read_bit()? {
        // adaptive_ref_pic_marking_mode_flag
        return Ok(());
    }

    loop {
        let op = reader.read_ue()?;
        if op == 0 {
            break;
        }
        if op == 1 || op == 3 {
            reader.skip_exp_golomb()?; // difference_of_pic_nums_minus1
        }
        if op == 2 {
            reader.skip_exp_golomb()?; // long_term_pic_num
        }
        if op == 3 || op == 6 {
            reader.skip_exp_golomb()?; // long_term_frame_idx
        }
        if op == 4 {
            reader.skip_exp_golomb()?; // max_long_term_frame_idx_plus1
        }
    }
    Ok(())
}

impl AvcParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a parameter set NAL unit (header included). Other unit types
    /// are ignored.
    pub fn parse_parameter_set(&mut self, unit: &[u8]) -> Result<()> {
        let Some((&header, payload)) = unit.split_first() else {
            return Err(CodecError::bad_data("unit of zero size"));
        };

        let rbsp = nal::remove_emulation_prevention(payload);
        let mut reader = BitReader::new(&rbsp);
        match avc::nal_type(header) {
            avc::SPS => self.parse_sps(&mut reader),
            avc::PPS => self.parse_pps(&mut reader),
            _ => Ok(()),
        }
    }

    fn parse_sps(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
        let profile_idc = reader.read_bits(8)?;
        reader.skip_bits(8)?; // constraint_set flags, reserved_zero_5bits
        reader.skip_bits(8)?; // level_idc
        let sps_id = reader.read_ue()?;
        if sps_id >= MAX_SPS_COUNT {
            return Err(CodecError::bad_data(format!("invalid sps id {sps_id}")));
        }

        let mut sps = Sps::default();
        match profile_idc {
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135 => {
                sps.chroma_format_idc = reader.read_ue()?;
                sps.chroma_array_type = sps.chroma_format_idc;
                if sps.chroma_format_idc == 3 {
                    sps.separate_colour_plane = reader.read_bit()?;
                    if sps.separate_colour_plane {
                        sps.chroma_array_type = 0;
                    }
                }
                reader.skip_exp_golomb()?; // bit_depth_luma_minus8
                reader.skip_exp_golomb()?; // bit_depth_chroma_minus8
                reader.read_bit()?; // qpprime_y_zero_transform_bypass_flag
                if reader.read_bit()? {
                    // seq_scaling_matrix_present_flag
                    let count = if sps.chroma_format_idc != 3 { 8 } else { 12 };
                    skip_scaling_matrix(reader, count)?;
                }
            }
            _ => {
                sps.chroma_format_idc = 1;
                sps.chroma_array_type = 1;
            }
        }

        sps.log2_max_frame_num = reader.read_ue()? + 4;
        sps.pic_order_cnt_type = reader.read_ue()?;
        match sps.pic_order_cnt_type {
            0 => sps.log2_max_pic_order_cnt_lsb = reader.read_ue()? + 4,
            1 => {
                sps.delta_pic_order_always_zero = reader.read_bit()?;
                reader.skip_exp_golomb()?; // offset_for_non_ref_pic
                reader.skip_exp_golomb()?; // offset_for_top_to_bottom_field
                let cycle = reader.read_ue()?;
                for _ in 0..cycle {
                    reader.skip_exp_golomb()?; // offset_for_ref_frame
                }
            }
            _ => {}
        }
        reader.skip_exp_golomb()?; // max_num_ref_frames
        reader.read_bit()?; // gaps_in_frame_num_value_allowed_flag
        sps.pic_width_in_mbs = reader.read_ue()? + 1;
        sps.pic_height_in_map_units = reader.read_ue()? + 1;
        sps.frame_mbs_only = reader.read_bit()?;
        if !sps.frame_mbs_only {
            reader.read_bit()?; // mb_adaptive_frame_field_flag
        }
        reader.read_bit()?; // direct_8x8_inference_flag
        if reader.read_bit()? {
            // frame_cropping_flag
            for _ in 0..4 {
                reader.skip_exp_golomb()?;
            }
        }
        if reader.read_bit()? {
            // vui_parameters_present_flag
            parse_vui_parameters(&mut sps, reader)?;
        }
        reader
            .rbsp_trailing_bits()
            .map_err(|_| CodecError::bad_data("sps: invalid trailing bits"))?;

        debug!(sps_id, log2_max_frame_num = sps.log2_max_frame_num, "parsed avc sps");
        store(&mut self.sps, sps_id as usize, sps);
        Ok(())
    }

    fn parse_pps(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
        let pps_id = reader.read_ue()?;
        if pps_id >= MAX_PPS_COUNT {
            return Err(CodecError::bad_data(format!("invalid pps id {pps_id}")));
        }

        let sps_id = reader.read_ue()? as usize;
        let chroma_format_idc = match self.sps.get(sps_id) {
            Some(Some(sps)) => sps.chroma_format_idc,
            _ => return Err(CodecError::bad_data(format!("non-existing sps id {sps_id}"))),
        };

        let mut pps = Pps {
            sps_id,
            entropy_coding_mode: reader.read_bit()?,
            bottom_field_pic_order_in_frame_present: reader.read_bit()?,
            num_slice_groups_minus1: reader.read_ue()?,
            ..Pps::default()
        };

        if pps.num_slice_groups_minus1 > 0 {
            pps.slice_group_map_type = reader.read_ue()?;
            match pps.slice_group_map_type {
                0 => {
                    for _ in 0..=pps.num_slice_groups_minus1 {
                        reader.skip_exp_golomb()?; // run_length_minus1
                    }
                }
                2 => {
                    for _ in 0..pps.num_slice_groups_minus1 {
                        reader.skip_exp_golomb()?; // top_left
                        reader.skip_exp_golomb()?; // bottom_right
                    }
                }
                3..=5 => {
                    reader.read_bit()?; // slice_group_change_direction_flag
                    pps.slice_group_change_rate = reader.read_ue()? + 1;
                }
                6 => {
                    let pic_size_in_map_units_minus1 = reader.read_ue()?;
                    let bits = ceil_log2(pps.num_slice_groups_minus1 + 1);
                    reader.skip_bits(u64::from(bits) * (u64::from(pic_size_in_map_units_minus1) + 1))?;
                }
                _ => {}
            }
        }

        pps.num_ref_idx = [reader.read_ue()? + 1, reader.read_ue()? + 1];
        pps.weighted_pred = reader.read_bit()?;
        pps.weighted_bipred_idc = reader.read_bits(2)?;
        reader.skip_exp_golomb()?; // pic_init_qp_minus26
        reader.skip_exp_golomb()?; // pic_init_qs_minus26
        reader.skip_exp_golomb()?; // chroma_qp_index_offset
        pps.deblocking_filter_control_present = reader.read_bit()?;
        reader.read_bit()?; // constrained_intra_pred_flag
        pps.redundant_pic_cnt_present = reader.read_bit()?;

        if reader.more_rbsp_data() {
            let transform_8x8_mode = reader.read_bit()?;
            if reader.read_bit()? {
                // pic_scaling_matrix_present_flag
                let per_8x8 = if chroma_format_idc != 3 { 2 } else { 6 };
                let count = 6 + if transform_8x8_mode { per_8x8 } else { 0 };
                skip_scaling_matrix(reader, count)?;
            }
            reader.skip_exp_golomb()?; // second_chroma_qp_index_offset
            reader
                .rbsp_trailing_bits()
                .map_err(|_| CodecError::bad_data("pps: invalid trailing bits"))?;
        }

        debug!(pps_id, sps_id, "parsed avc pps");
        store(&mut self.pps, pps_id as usize, pps);
        Ok(())
    }

    /// Size in bytes of the slice header of `nal_unit` (NAL header byte and
    /// emulation prevention bytes included)
    pub fn slice_header_size(&self, nal_unit: &[u8]) -> Result<usize> {
        let Some((&header, payload)) = nal_unit.split_first() else {
            return Err(CodecError::UnexpectedEof);
        };

        let rbsp = nal::remove_emulation_prevention(payload);
        let mut reader = BitReader::new(&rbsp);

        let nal_ref_idc = (header >> 5) & 0x3;
        let nal_unit_type = avc::nal_type(header);

        reader.skip_exp_golomb()?; // first_mb_in_slice
        let mut slice_type = reader.read_ue()?;
        if slice_type > 9 {
            return Err(CodecError::bad_data(format!("invalid slice type {slice_type}")));
        }
        if slice_type >= 5 {
            slice_type -= 5;
        }

        let pps_id = reader.read_ue()? as usize;
        let pps = match self.pps.get(pps_id) {
            Some(Some(pps)) => pps,
            _ => return Err(CodecError::bad_data(format!("non-existing pps id {pps_id}"))),
        };
        let sps = match self.sps.get(pps.sps_id) {
            Some(Some(sps)) => sps,
            _ => return Err(CodecError::bad_data(format!("non-existing sps id {}", pps.sps_id))),
        };

        if sps.separate_colour_plane {
            reader.skip_bits(2)?; // colour_plane_id
        }
        reader.skip_bits(u64::from(sps.log2_max_frame_num))?; // frame_num

        let mut field_pic = false;
        if !sps.frame_mbs_only {
            field_pic = reader.read_bit()?;
            if field_pic {
                reader.read_bit()?; // bottom_field_flag
            }
        }

        if nal_unit_type == avc::IDR_SLICE {
            reader.skip_exp_golomb()?; // idr_pic_id
        }

        if sps.pic_order_cnt_type == 0 {
            reader.skip_bits(u64::from(sps.log2_max_pic_order_cnt_lsb))?; // pic_order_cnt_lsb
            if pps.bottom_field_pic_order_in_frame_present && !field_pic {
                reader.skip_exp_golomb()?; // delta_pic_order_cnt_bottom
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero {
            reader.skip_exp_golomb()?; // delta_pic_order_cnt[0]
            if pps.bottom_field_pic_order_in_frame_present && !field_pic {
                reader.skip_exp_golomb()?; // delta_pic_order_cnt[1]
            }
        }

        if pps.redundant_pic_cnt_present {
            reader.skip_exp_golomb()?; // redundant_pic_cnt
        }

        if slice_type == SLICE_B {
            reader.read_bit()?; // direct_spatial_mv_pred_flag
        }

        let mut num_ref_idx = pps.num_ref_idx;
        if matches!(slice_type, SLICE_P | SLICE_SP | SLICE_B) && reader.read_bit()? {
            // num_ref_idx_active_override_flag
            num_ref_idx[0] = reader.read_ue()? + 1;
            if slice_type == SLICE_B {
                num_ref_idx[1] = reader.read_ue()? + 1;
            }
        }

        let mvc = nal_unit_type == avc::SLICE_EXT || nal_unit_type == avc::SLICE_EXT_DEPTH;
        skip_ref_pic_list_modification(&mut reader, slice_type, mvc)?;

        if (pps.weighted_pred && matches!(slice_type, SLICE_P | SLICE_SP))
            || (pps.weighted_bipred_idc == 1 && slice_type == SLICE_B)
        {
            skip_pred_weight_table(&mut reader, slice_type, num_ref_idx, sps.chroma_array_type)?;
        }

        if nal_ref_idc != 0 {
            skip_dec_ref_pic_marking(&mut reader, nal_unit_type)?;
        }

        if pps.entropy_coding_mode && slice_type != SLICE_I && slice_type != SLICE_SI {
            reader.skip_exp_golomb()?; // cabac_init_idc
        }

        reader.skip_exp_golomb()?; // slice_qp_delta
        if slice_type == SLICE_SP || slice_type == SLICE_SI {
            if slice_type == SLICE_SP {
                reader.read_bit()?; // sp_for_switch_flag
            }
            reader.skip_exp_golomb()?; // slice_qs_delta
        }

        if pps.deblocking_filter_control_present {
            let disable_deblocking_filter_idc = reader.read_ue()?;
            if disable_deblocking_filter_idc != 1 {
                reader.skip_exp_golomb()?; // slice_alpha_c0_offset_div2
                reader.skip_exp_golomb()?; // slice_beta_offset_div2
            }
        }

        if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
            let pic_size_in_map_units = sps.pic_height_in_map_units * sps.pic_width_in_mbs;
            let len = pic_size_in_map_units.div_ceil(pps.slice_group_change_rate.max(1));
            reader.skip_bits(u64::from(ceil_log2(len + 1)))?; // slice_group_change_cycle
        }

        Ok(encoded_header_size(avc::HEADER_SIZE, &rbsp, reader.bytes_touched()))
    }

    /// Whether a NAL unit with this header byte carries slice data.
    ///
    /// Data partitioning (types 2-4) is rejected.
    pub fn is_slice(header: u8) -> Result<bool> {
        match avc::nal_type(header) {
            avc::SLICE | avc::IDR_SLICE => Ok(true),
            avc::DPA | avc::DPB | avc::DPC => Err(CodecError::unsupported("nal types 2-4 are not supported")),
            _ => Ok(false),
        }
    }

    /// First non-zero transfer characteristics signalled by any SPS
    pub fn transfer_characteristics(&self) -> u8 {
        self.sps
            .iter()
            .flatten()
            .map(|sps| sps.transfer_characteristics)
            .find(|&tc| tc != 0)
            .unwrap_or(0)
    }
}

/// Header size in the escaped bitstream: NAL header, the bytes consumed from
/// the RBSP, and any emulation prevention bytes those bytes required
pub(crate) fn encoded_header_size(nal_header_size: usize, rbsp: &Cow<'_, [u8]>, touched: usize) -> usize {
    let mut size = nal_header_size + touched;
    if let Cow::Owned(decoded) = rbsp {
        size += nal::emulation_prevention_count(&decoded[..touched.min(decoded.len())]);
    }
    size
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::BitWriter;

    /// Baseline SPS: profile 66, sps_id 0, log2_max_frame_num 4 (+4 = 8 bits),
    /// poc type 0 with lsb of 8 bits, frame_mbs_only.
    pub(crate) fn baseline_sps() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.bits(66, 8); // profile_idc
        w.bits(0, 8); // constraints
        w.bits(30, 8); // level_idc
        w.ue(0); // sps id
        w.ue(4); // log2_max_frame_num_minus4
        w.ue(0); // poc type
        w.ue(4); // log2_max_pic_order_cnt_lsb_minus4
        w.ue(1); // max_num_ref_frames
        w.bit(false); // gaps
        w.ue(19); // width in mbs - 1
        w.ue(14); // height in map units - 1
        w.bit(true); // frame_mbs_only
        w.bit(true); // direct_8x8
        w.bit(false); // cropping
        w.bit(false); // vui
        w.trailing_bits();
        let mut unit = vec![0x67];
        unit.extend(w.finish());
        unit
    }

    pub(crate) fn cavlc_pps() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.ue(0); // pps id
        w.ue(0); // sps id
        w.bit(false); // entropy_coding_mode
        w.bit(false); // bottom_field_pic_order
        w.ue(0); // num_slice_groups_minus1
        w.ue(0); // num_ref_idx_l0_default_minus1
        w.ue(0); // num_ref_idx_l1_default_minus1
        w.bit(false); // weighted_pred
        w.bits(0, 2); // weighted_bipred_idc
        w.se(0); // pic_init_qp_minus26
        w.se(0); // pic_init_qs_minus26
        w.se(0); // chroma_qp_index_offset
        w.bit(true); // deblocking_filter_control_present
        w.bit(false); // constrained_intra_pred
        w.bit(false); // redundant_pic_cnt_present
        w.trailing_bits();
        let mut unit = vec![0x68];
        unit.extend(w.finish());
        unit
    }

    fn parser() -> AvcParser {
        let mut parser = AvcParser::new();
        parser.parse_parameter_set(&baseline_sps()).unwrap();
        parser.parse_parameter_set(&cavlc_pps()).unwrap();
        parser
    }

    #[test]
    fn test_idr_slice_header_size() {
        let mut w = BitWriter::new();
        w.ue(0); // first_mb_in_slice
        w.ue(7); // slice_type I (all)
        w.ue(0); // pps id
        w.bits(0, 8); // frame_num
        w.ue(0); // idr_pic_id
        w.bits(0, 8); // pic_order_cnt_lsb
        w.bit(false); // no_output_of_prior_pics
        w.bit(false); // long_term_reference
        w.se(-2); // slice_qp_delta
        w.ue(0); // disable_deblocking_filter_idc
        w.se(0);
        w.se(0);
        let header_bits = w.bit_len();
        w.bits(0xabcd, 16); // macroblock data
        let mut nal_unit = vec![0x65];
        nal_unit.extend(w.finish());

        let size = parser().slice_header_size(&nal_unit).unwrap();
        assert_eq!(size, 1 + header_bits.div_ceil(8));
    }

    #[test]
    fn test_p_slice_with_override_and_marking() {
        let mut w = BitWriter::new();
        w.ue(0); // first_mb_in_slice
        w.ue(5); // slice_type P (all)
        w.ue(0); // pps id
        w.bits(3, 8); // frame_num
        w.bits(6, 8); // pic_order_cnt_lsb
        w.bit(true); // num_ref_idx_active_override_flag
        w.ue(1);
        w.bit(false); // ref_pic_list_modification_flag_l0
        w.bit(false); // adaptive_ref_pic_marking_mode_flag
        w.se(1); // slice_qp_delta
        w.ue(1); // deblocking disabled
        let header_bits = w.bit_len();
        w.bits(0xffff, 16);
        let mut nal_unit = vec![0x41];
        nal_unit.extend(w.finish());

        let size = parser().slice_header_size(&nal_unit).unwrap();
        assert_eq!(size, 1 + header_bits.div_ceil(8));
    }

    #[test]
    fn test_slice_with_unknown_pps() {
        let mut w = BitWriter::new();
        w.ue(0);
        w.ue(7);
        w.ue(3); // pps id 3 was never seen
        w.bits(0, 16);
        let mut nal_unit = vec![0x65];
        nal_unit.extend(w.finish());

        assert!(matches!(parser().slice_header_size(&nal_unit), Err(CodecError::BadData(_))));
    }

    #[test]
    fn test_truncated_slice() {
        assert_eq!(parser().slice_header_size(&[0x65]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn test_pps_requires_sps() {
        let mut parser = AvcParser::new();
        assert!(parser.parse_parameter_set(&cavlc_pps()).is_err());
    }

    #[test]
    fn test_is_slice() {
        assert_eq!(AvcParser::is_slice(0x65), Ok(true));
        assert_eq!(AvcParser::is_slice(0x41), Ok(true));
        assert_eq!(AvcParser::is_slice(0x67), Ok(false));
        assert_eq!(AvcParser::is_slice(0x06), Ok(false));
        assert!(AvcParser::is_slice(0x22).is_err());
    }

    #[test]
    fn test_encoded_header_size_counts_escapes() {
        let escaped = [0x00, 0x00, 0x03, 0x01, 0x80];
        let rbsp = nal::remove_emulation_prevention(&escaped);
        assert_eq!(encoded_header_size(1, &rbsp, 3), 1 + 3 + 1);
    }
}
