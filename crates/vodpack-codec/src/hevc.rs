//! H.265/HEVC parameter sets and slice segment header sizing.

use tracing::debug;

use crate::avc::encoded_header_size;
use crate::bits::{ceil_log2, BitReader};
use crate::error::{CodecError, Result};
use crate::nal::{self, hevc};

const MAX_SPS_COUNT: u32 = 32;
const MAX_PPS_COUNT: u32 = 256;
const MAX_SHORT_TERM_RPS_COUNT: u32 = 64;
const MAX_LONG_TERM_RPS_COUNT: u32 = 32;
const MAX_REFS: u32 = 16;
const MAX_DELTA_POCS: usize = 32;
const EXTENDED_SAR: u32 = 255;

const SLICE_B: u32 = 0;
const SLICE_P: u32 = 1;

#[derive(Debug, Clone, Default)]
struct ShortTermRps {
    delta_poc: Vec<i32>,
    used: Vec<bool>,
}

impl ShortTermRps {
    fn used_count(&self) -> u32 {
        self.used.iter().filter(|&&u| u).count() as u32
    }
}

#[derive(Debug, Clone, Default)]
struct Sps {
    max_sub_layers_minus1: u32,
    chroma_format_idc: u32,
    separate_colour_plane: bool,
    pic_width_in_luma_samples: u32,
    pic_height_in_luma_samples: u32,
    bit_depth_luma: u32,
    bit_depth_chroma: u32,
    log2_max_pic_order_cnt_lsb: u32,
    log2_min_luma_coding_block_size: u32,
    log2_diff_max_min_luma_coding_block_size: u32,
    sample_adaptive_offset_enabled: bool,
    st_rps: Vec<ShortTermRps>,
    long_term_ref_pics_present: bool,
    num_long_term_ref_pics_sps: u32,
    used_by_curr_pic_lt_sps: u32,
    temporal_mvp_enabled: bool,
    motion_vector_resolution_control_idc: u32,
    transfer_characteristics: u8,
}

impl Sps {
    fn chroma_array_type(&self) -> u32 {
        if self.separate_colour_plane {
            0
        } else {
            self.chroma_format_idc
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Pps {
    sps_id: usize,
    dependent_slice_segments_enabled: bool,
    output_flag_present: bool,
    num_extra_slice_header_bits: u32,
    cabac_init_present: bool,
    num_ref_idx: [u32; 2],
    slice_chroma_qp_offsets_present: bool,
    weighted_pred: bool,
    weighted_bipred: bool,
    tiles_enabled: bool,
    entropy_coding_sync_enabled: bool,
    loop_filter_across_slices_enabled: bool,
    deblocking_filter_override_enabled: bool,
    deblocking_filter_disabled: bool,
    lists_modification_present: bool,
    slice_segment_header_extension_present: bool,
    chroma_qp_offset_list_enabled: bool,
    curr_pic_ref_enabled: bool,
    slice_act_qp_offsets_present: bool,
}

/// Parameter-set state for measuring HEVC slice segment headers
#[derive(Debug, Clone, Default)]
pub struct HevcParser {
    sps: Vec<Option<Sps>>,
    pps: Vec<Option<Pps>>,
}

fn store<T>(table: &mut Vec<Option<T>>, id: usize, value: T) {
    if table.len() <= id {
        table.resize_with(id + 1, || None);
    }
    table[id] = Some(value);
}

fn skip_profile_tier_level(reader: &mut BitReader<'_>, max_sub_layers_minus1: u32) -> Result<()> {
    // general_profile_space .. general_reserved_zero_bit
    reader.skip_bits(2 + 1 + 5 + 32 + 4 + 43 + 1)?;
    reader.skip_bits(8)?; // general_level_idc

    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    for i in 0..max_sub_layers_minus1 as usize {
        profile_present[i] = reader.read_bit()?;
        level_present[i] = reader.read_bit()?;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            reader.skip_bits(2)?; // reserved_zero_2bits
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            reader.skip_bits(2 + 1 + 5 + 32 + 4 + 43 + 1)?;
        }
        if level_present[i] {
            reader.skip_bits(8)?; // sub_layer_level_idc
        }
    }
    Ok(())
}

fn skip_scaling_list_data(reader: &mut BitReader<'_>) -> Result<()> {
    for size_id in 0..4u32 {
        let step = if size_id == 3 { 3 } else { 1 };
        for _ in (0..6).step_by(step) {
            if !reader.read_bit()? {
                // scaling_list_pred_mode_flag
                reader.skip_exp_golomb()?; // scaling_list_pred_matrix_id_delta
                continue;
            }
            let coef_num = 64.min(1 << (4 + (size_id << 1)));
            if size_id > 1 {
                reader.skip_exp_golomb()?; // scaling_list_dc_coef_minus8
            }
            for _ in 0..coef_num {
                reader.skip_exp_golomb()?; // scaling_list_delta_coef
            }
        }
    }
    Ok(())
}

fn skip_sub_layer_hrd_parameters(reader: &mut BitReader<'_>, cpb_cnt_minus1: u32, sub_pic: bool) -> Result<()> {
    for _ in 0..=cpb_cnt_minus1 {
        reader.skip_exp_golomb()?; // bit_rate_value_minus1
        reader.skip_exp_golomb()?; // cpb_size_value_minus1
        if sub_pic {
            reader.skip_exp_golomb()?; // cpb_size_du_value_minus1
            reader.skip_exp_golomb()?; // bit_rate_du_value_minus1
        }
        reader.read_bit()?; // cbr_flag
    }
    Ok(())
}

fn skip_hrd_parameters(reader: &mut BitReader<'_>, common_inf_present: bool, max_sub_layers_minus1: u32) -> Result<()> {
    let mut nal_hrd = false;
    let mut vcl_hrd = false;
    let mut sub_pic = false;

    if common_inf_present {
        nal_hrd = reader.read_bit()?;
        vcl_hrd = reader.read_bit()?;
        if nal_hrd || vcl_hrd {
            sub_pic = reader.read_bit()?;
            if sub_pic {
                reader.skip_bits(8 + 5 + 1 + 5)?;
            }
            reader.skip_bits(4 + 4)?; // bit_rate_scale, cpb_size_scale
            if sub_pic {
                reader.skip_bits(4)?; // cpb_size_du_scale
            }
            reader.skip_bits(5 + 5 + 5)?;
        }
    }

    for _ in 0..=max_sub_layers_minus1 {
        let fixed_pic_rate_general = reader.read_bit()?;
        let fixed_pic_rate_within_cvs = if fixed_pic_rate_general { true } else { reader.read_bit()? };

        let mut low_delay_hrd = false;
        if fixed_pic_rate_within_cvs {
            reader.skip_exp_golomb()?; // elemental_duration_in_tc_minus1
        } else {
            low_delay_hrd = reader.read_bit()?;
        }

        let mut cpb_cnt_minus1 = 0;
        if !low_delay_hrd {
            cpb_cnt_minus1 = reader.read_ue()?;
        }
        if nal_hrd {
            skip_sub_layer_hrd_parameters(reader, cpb_cnt_minus1, sub_pic)?;
        }
        if vcl_hrd {
            skip_sub_layer_hrd_parameters(reader, cpb_cnt_minus1, sub_pic)?;
        }
    }
    Ok(())
}

fn parse_vui_parameters(sps: &mut Sps, reader: &mut BitReader<'_>) -> Result<()> {
    if reader.read_bit()? {
        // aspect_ratio_info_present_flag
        if reader.read_bits(8)? == EXTENDED_SAR {
            reader.skip_bits(32)?; // sar_width, sar_height
        }
    }
    if reader.read_bit()? {
        reader.read_bit()?; // overscan_appropriate_flag
    }
    if reader.read_bit()? {
        // video_signal_type_present_flag
        reader.skip_bits(3 + 1)?; // video_format, video_full_range_flag
        if reader.read_bit()? {
            reader.skip_bits(8)?; // colour_primaries
            sps.transfer_characteristics = reader.read_bits(8)? as u8;
            reader.skip_bits(8)?; // matrix_coeffs
        }
    }
    if reader.read_bit()? {
        // chroma_loc_info_present_flag
        reader.skip_exp_golomb()?;
        reader.skip_exp_golomb()?;
    }
    reader.skip_bits(3)?; // neutral_chroma_indication, field_seq, frame_field_info_present
    if reader.read_bit()? {
        // default_display_window_flag
        for _ in 0..4 {
            reader.skip_exp_golomb()?;
        }
    }
    if reader.read_bit()? {
        // vui_timing_info_present_flag
        reader.skip_bits(64)?; // vui_num_units_in_tick, vui_time_scale
        if reader.read_bit()? {
            reader.skip_exp_golomb()?; // vui_num_ticks_poc_diff_one_minus1
        }
        if reader.read_bit()? {
            skip_hrd_parameters(reader, true, sps.max_sub_layers_minus1)?;
        }
    }
    if reader.read_bit()? {
        // bitstream_restriction_flag
        reader.skip_bits(3)?;
        for _ in 0..5 {
            reader.skip_exp_golomb()?;
        }
    }
    Ok(())
}

/// Parse `st_ref_pic_set(idx)`; `sets` holds the sets already parsed
fn parse_st_ref_pic_set(
    reader: &mut BitReader<'_>,
    sets: &[ShortTermRps],
    idx: usize,
    num_sets: usize,
) -> Result<ShortTermRps> {
    let inter_ref_pic_set_prediction = idx != 0 && reader.read_bit()?;

    if !inter_ref_pic_set_prediction {
        let num_negative = reader.read_ue()?;
        let num_positive = reader.read_ue()?;
        if num_negative >= MAX_REFS || num_positive >= MAX_REFS {
            return Err(CodecError::bad_data("too many refs in short term rps"));
        }

        let mut rps = ShortTermRps::default();
        let mut prev = 0i32;
        for _ in 0..num_negative {
            prev -= reader.read_ue()? as i32 + 1; // delta_poc_s0_minus1
            rps.delta_poc.push(prev);
            rps.used.push(reader.read_bit()?);
        }
        prev = 0;
        for _ in 0..num_positive {
            prev += reader.read_ue()? as i32 + 1; // delta_poc_s1_minus1
            rps.delta_poc.push(prev);
            rps.used.push(reader.read_bit()?);
        }
        return Ok(rps);
    }

    let mut delta_idx = 1usize;
    if idx == num_sets {
        delta_idx = reader.read_ue()? as usize + 1;
        if delta_idx > idx {
            return Err(CodecError::bad_data("invalid delta_idx_minus1"));
        }
    }
    let reference = sets
        .get(idx - delta_idx)
        .ok_or_else(|| CodecError::bad_data("missing reference rps"))?;

    let delta_rps_sign = reader.read_bit()?;
    let abs_delta_rps = reader.read_ue()? + 1;
    if abs_delta_rps > 32768 {
        return Err(CodecError::bad_data(format!("invalid abs_delta_rps {abs_delta_rps}")));
    }
    let delta_rps = if delta_rps_sign { -(abs_delta_rps as i32) } else { abs_delta_rps as i32 };

    let mut entries = Vec::new();
    for i in 0..=reference.delta_poc.len() {
        let used = reader.read_bit()?;
        let use_delta = used || reader.read_bit()?;
        if use_delta {
            let delta_poc = delta_rps + reference.delta_poc.get(i).copied().unwrap_or(0);
            entries.push((delta_poc, used));
            if entries.len() > MAX_DELTA_POCS {
                return Err(CodecError::bad_data("too many delta pocs in short term rps"));
            }
        }
    }

    // increasing order, then the negative values flipped to largest first
    entries.sort_by_key(|&(poc, _)| poc);
    let num_negative = entries.iter().filter(|&&(poc, _)| poc < 0).count();
    entries[..num_negative].reverse();

    Ok(ShortTermRps {
        delta_poc: entries.iter().map(|&(poc, _)| poc).collect(),
        used: entries.iter().map(|&(_, used)| used).collect(),
    })
}

fn skip_pred_weight_table(
    reader: &mut BitReader<'_>,
    slice_type: u32,
    num_ref_idx: [u32; 2],
    chroma_array_type: u32,
) -> Result<()> {
    reader.skip_exp_golomb()?; // luma_log2_weight_denom
    if chroma_array_type != 0 {
        reader.skip_exp_golomb()?; // delta_chroma_log2_weight_denom
    }

    let lists = if slice_type == SLICE_B { 2 } else { 1 };
    for &count in &num_ref_idx[..lists] {
        let count = count as usize;
        let mut luma = vec![false; count];
        let mut chroma = vec![false; count];
        for flag in luma.iter_mut() {
            *flag = reader.read_bit()?;
        }
        if chroma_array_type != 0 {
            for flag in chroma.iter_mut() {
                *flag = reader.read_bit()?;
            }
        }
        for i in 0..count {
            if luma[i] {
                reader.skip_exp_golomb()?; // delta_luma_weight
                reader.skip_exp_golomb()?; // luma_offset
            }
            if chroma[i] {
                for _ in 0..4 {
                    reader.skip_exp_golomb()?; // delta_chroma_weight, delta_chroma_offset
                }
            }
        }
    }
    Ok(())
}

impl HevcParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a parameter set NAL unit (header included). Other unit types
    /// are ignored.
    pub fn parse_parameter_set(&mut self, unit: &[u8]) -> Result<()> {
        if unit.len() < hevc::HEADER_SIZE {
            return Err(CodecError::bad_data("unit smaller than header size"));
        }

        let rbsp = nal::remove_emulation_prevention(&unit[hevc::HEADER_SIZE..]);
        let mut reader = BitReader::new(&rbsp);
        match hevc::nal_type(unit[0]) {
            hevc::SPS => self.parse_sps(&mut reader),
            hevc::PPS => self.parse_pps(&mut reader),
            _ => Ok(()),
        }
    }

    fn parse_sps(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
        reader.skip_bits(4)?; // sps_video_parameter_set_id
        let max_sub_layers_minus1 = reader.read_bits(3)?;
        reader.read_bit()?; // sps_temporal_id_nesting_flag
        skip_profile_tier_level(reader, max_sub_layers_minus1)?;

        let sps_id = reader.read_ue()?;
        if sps_id >= MAX_SPS_COUNT {
            return Err(CodecError::bad_data(format!("invalid sps id {sps_id}")));
        }

        let mut sps = Sps {
            max_sub_layers_minus1,
            chroma_format_idc: reader.read_ue()?,
            ..Sps::default()
        };
        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane = reader.read_bit()?;
        }
        sps.pic_width_in_luma_samples = reader.read_ue()?;
        sps.pic_height_in_luma_samples = reader.read_ue()?;
        if reader.read_bit()? {
            // conformance_window_flag
            for _ in 0..4 {
                reader.skip_exp_golomb()?;
            }
        }
        sps.bit_depth_luma = reader.read_ue()? + 8;
        sps.bit_depth_chroma = reader.read_ue()? + 8;
        sps.log2_max_pic_order_cnt_lsb = reader.read_ue()? + 4;

        let ordering_info_present = reader.read_bit()?;
        let first = if ordering_info_present { 0 } else { max_sub_layers_minus1 };
        for _ in first..=max_sub_layers_minus1 {
            reader.skip_exp_golomb()?; // sps_max_dec_pic_buffering_minus1
            reader.skip_exp_golomb()?; // sps_max_num_reorder_pics
            reader.skip_exp_golomb()?; // sps_max_latency_increase_plus1
        }

        sps.log2_min_luma_coding_block_size = reader.read_ue()? + 3;
        sps.log2_diff_max_min_luma_coding_block_size = reader.read_ue()?;
        for _ in 0..4 {
            // transform block sizes, hierarchy depths
            reader.skip_exp_golomb()?;
        }
        if reader.read_bit()? && reader.read_bit()? {
            // scaling_list_enabled_flag, sps_scaling_list_data_present_flag
            skip_scaling_list_data(reader)?;
        }
        reader.read_bit()?; // amp_enabled_flag
        sps.sample_adaptive_offset_enabled = reader.read_bit()?;
        if reader.read_bit()? {
            // pcm_enabled_flag
            reader.skip_bits(4 + 4)?;
            reader.skip_exp_golomb()?;
            reader.skip_exp_golomb()?;
            reader.read_bit()?; // pcm_loop_filter_disabled_flag
        }

        let num_short_term_ref_pic_sets = reader.read_ue()?;
        if num_short_term_ref_pic_sets > MAX_SHORT_TERM_RPS_COUNT {
            return Err(CodecError::bad_data(format!(
                "invalid num_short_term_ref_pic_sets {num_short_term_ref_pic_sets}"
            )));
        }
        let num_sets = num_short_term_ref_pic_sets as usize;
        for i in 0..num_sets {
            let rps = parse_st_ref_pic_set(reader, &sps.st_rps, i, num_sets)?;
            sps.st_rps.push(rps);
        }

        sps.long_term_ref_pics_present = reader.read_bit()?;
        if sps.long_term_ref_pics_present {
            sps.num_long_term_ref_pics_sps = reader.read_ue()?;
            if sps.num_long_term_ref_pics_sps > MAX_LONG_TERM_RPS_COUNT {
                return Err(CodecError::bad_data(format!(
                    "invalid num_long_term_ref_pics_sps {}",
                    sps.num_long_term_ref_pics_sps
                )));
            }
            for i in 0..sps.num_long_term_ref_pics_sps {
                reader.skip_bits(u64::from(sps.log2_max_pic_order_cnt_lsb))?; // lt_ref_pic_poc_lsb_sps
                if reader.read_bit()? {
                    sps.used_by_curr_pic_lt_sps |= 1 << i;
                }
            }
        }
        sps.temporal_mvp_enabled = reader.read_bit()?;
        reader.read_bit()?; // strong_intra_smoothing_enabled_flag
        if reader.read_bit()? {
            // vui_parameters_present_flag
            parse_vui_parameters(&mut sps, reader)?;
        }

        let mut extension_4bits = 0;
        if reader.read_bit()? {
            // sps_extension_present_flag
            let range = reader.read_bit()?;
            let multilayer = reader.read_bit()?;
            let three_d = reader.read_bit()?;
            let scc = reader.read_bit()?;
            extension_4bits = reader.read_bits(4)?;

            if range {
                reader.skip_bits(9)?; // sps_range_extension flags
            }
            if multilayer {
                reader.read_bit()?; // inter_view_mv_vert_constraint_flag
            }
            if three_d {
                Self::skip_sps_3d_extension(reader)?;
            }
            if scc {
                Self::parse_sps_scc_extension(&mut sps, reader)?;
            }
        }

        // sps_extension_data_flag payloads are ignored
        if extension_4bits == 0 {
            reader
                .rbsp_trailing_bits()
                .map_err(|_| CodecError::bad_data("sps: invalid trailing bits"))?;
        }

        debug!(sps_id, st_rps = sps.st_rps.len(), "parsed hevc sps");
        store(&mut self.sps, sps_id as usize, sps);
        Ok(())
    }

    fn skip_sps_3d_extension(reader: &mut BitReader<'_>) -> Result<()> {
        // d == 0
        reader.skip_bits(2)?; // iv_di_mc_enabled_flag, iv_mv_scal_enabled_flag
        reader.skip_exp_golomb()?; // log2_ivmc_sub_pb_size_minus3
        reader.skip_bits(4)?; // iv_res_pred, depth_ref, vsp_mc, dbbp
        // d == 1
        reader.skip_bits(3)?; // iv_di_mc, iv_mv_scal, tex_mc
        reader.skip_exp_golomb()?; // log2_texmc_sub_pb_size_minus3
        reader.skip_bits(5)?; // intra_contour .. skip_intra
        Ok(())
    }

    fn parse_sps_scc_extension(sps: &mut Sps, reader: &mut BitReader<'_>) -> Result<()> {
        reader.read_bit()?; // sps_curr_pic_ref_enabled_flag
        if reader.read_bit()? {
            // palette_mode_enabled_flag
            reader.skip_exp_golomb()?; // palette_max_size
            reader.skip_exp_golomb()?; // delta_palette_max_predictor_size
            if reader.read_bit()? {
                // sps_palette_predictor_initializer_present_flag
                let count = u64::from(reader.read_ue()?) + 1;
                let comps = if sps.chroma_format_idc == 0 { 1 } else { 3 };
                for comp in 0..comps {
                    let depth = if comp == 0 { sps.bit_depth_luma } else { sps.bit_depth_chroma };
                    reader.skip_bits(count * u64::from(depth))?;
                }
            }
        }
        sps.motion_vector_resolution_control_idc = reader.read_bits(2)?;
        reader.read_bit()?; // intra_boundary_filtering_disabled_flag
        Ok(())
    }

    fn parse_pps(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
        let pps_id = reader.read_ue()?;
        if pps_id >= MAX_PPS_COUNT {
            return Err(CodecError::bad_data(format!("invalid pps id {pps_id}")));
        }

        let sps_id = reader.read_ue()? as usize;
        if !matches!(self.sps.get(sps_id), Some(Some(_))) {
            return Err(CodecError::bad_data(format!("non-existing sps id {sps_id}")));
        }

        let mut pps = Pps {
            sps_id,
            dependent_slice_segments_enabled: reader.read_bit()?,
            output_flag_present: reader.read_bit()?,
            num_extra_slice_header_bits: reader.read_bits(3)?,
            ..Pps::default()
        };
        reader.read_bit()?; // sign_data_hiding_enabled_flag
        pps.cabac_init_present = reader.read_bit()?;
        pps.num_ref_idx = [reader.read_ue()? + 1, reader.read_ue()? + 1];
        reader.skip_exp_golomb()?; // init_qp_minus26
        reader.read_bit()?; // constrained_intra_pred_flag
        let transform_skip_enabled = reader.read_bit()?;
        if reader.read_bit()? {
            // cu_qp_delta_enabled_flag
            reader.skip_exp_golomb()?; // diff_cu_qp_delta_depth
        }
        reader.skip_exp_golomb()?; // pps_cb_qp_offset
        reader.skip_exp_golomb()?; // pps_cr_qp_offset
        pps.slice_chroma_qp_offsets_present = reader.read_bit()?;
        pps.weighted_pred = reader.read_bit()?;
        pps.weighted_bipred = reader.read_bit()?;
        reader.read_bit()?; // transquant_bypass_enabled_flag
        pps.tiles_enabled = reader.read_bit()?;
        pps.entropy_coding_sync_enabled = reader.read_bit()?;
        if pps.tiles_enabled {
            let columns_minus1 = reader.read_ue()?;
            let rows_minus1 = reader.read_ue()?;
            if !reader.read_bit()? {
                // uniform_spacing_flag
                for _ in 0..(u64::from(columns_minus1) + u64::from(rows_minus1)) {
                    reader.skip_exp_golomb()?; // column_width_minus1, row_height_minus1
                }
            }
            reader.read_bit()?; // loop_filter_across_tiles_enabled_flag
        }
        pps.loop_filter_across_slices_enabled = reader.read_bit()?;
        if reader.read_bit()? {
            // deblocking_filter_control_present_flag
            pps.deblocking_filter_override_enabled = reader.read_bit()?;
            pps.deblocking_filter_disabled = reader.read_bit()?;
            if !pps.deblocking_filter_disabled {
                reader.skip_exp_golomb()?; // pps_beta_offset_div2
                reader.skip_exp_golomb()?; // pps_tc_offset_div2
            }
        }
        if reader.read_bit()? {
            // pps_scaling_list_data_present_flag
            skip_scaling_list_data(reader)?;
        }
        pps.lists_modification_present = reader.read_bit()?;
        reader.skip_exp_golomb()?; // log2_parallel_merge_level_minus2
        pps.slice_segment_header_extension_present = reader.read_bit()?;

        let mut extension_4bits = 0;
        if reader.read_bit()? {
            // pps_extension_present_flag
            let range = reader.read_bit()?;
            let multilayer = reader.read_bit()?;
            let three_d = reader.read_bit()?;
            let scc = reader.read_bit()?;
            extension_4bits = reader.read_bits(4)?;

            if range {
                if transform_skip_enabled {
                    reader.skip_exp_golomb()?; // log2_max_transform_skip_block_size_minus2
                }
                reader.read_bit()?; // cross_component_prediction_enabled_flag
                pps.chroma_qp_offset_list_enabled = reader.read_bit()?;
                if pps.chroma_qp_offset_list_enabled {
                    reader.skip_exp_golomb()?; // diff_cu_chroma_qp_offset_depth
                    let len_minus1 = reader.read_ue()?;
                    for _ in 0..=len_minus1 {
                        reader.skip_exp_golomb()?; // cb_qp_offset_list
                        reader.skip_exp_golomb()?; // cr_qp_offset_list
                    }
                }
                reader.skip_exp_golomb()?; // log2_sao_offset_scale_luma
                reader.skip_exp_golomb()?; // log2_sao_offset_scale_chroma
            }
            if multilayer || three_d {
                return Err(CodecError::unsupported("multilayer and 3d pps extensions"));
            }
            if scc {
                Self::parse_pps_scc_extension(&mut pps, reader)?;
            }
        }

        if extension_4bits == 0 {
            reader
                .rbsp_trailing_bits()
                .map_err(|_| CodecError::bad_data("pps: invalid trailing bits"))?;
        }

        debug!(pps_id, sps_id, "parsed hevc pps");
        store(&mut self.pps, pps_id as usize, pps);
        Ok(())
    }

    fn parse_pps_scc_extension(pps: &mut Pps, reader: &mut BitReader<'_>) -> Result<()> {
        pps.curr_pic_ref_enabled = reader.read_bit()?;
        if reader.read_bit()? {
            // residual_adaptive_colour_transform_enabled_flag
            pps.slice_act_qp_offsets_present = reader.read_bit()?;
            for _ in 0..3 {
                reader.skip_exp_golomb()?; // pps_act_{y,cb,cr}_qp_offset
            }
        }
        if reader.read_bit()? {
            // pps_palette_predictor_initializer_present_flag
            let count = u64::from(reader.read_ue()?);
            if count > 0 {
                let monochrome = reader.read_bit()?;
                let luma_depth = u64::from(reader.read_ue()?) + 8;
                let chroma_depth = if monochrome { 0 } else { u64::from(reader.read_ue()?) + 8 };
                reader.skip_bits(count * luma_depth)?;
                if !monochrome {
                    reader.skip_bits(2 * count * chroma_depth)?;
                }
            }
        }
        Ok(())
    }

    /// Size in bytes of the slice segment header of `nal_unit` (2-byte NAL
    /// header and emulation prevention bytes included)
    pub fn slice_header_size(&self, nal_unit: &[u8]) -> Result<usize> {
        if nal_unit.len() < hevc::HEADER_SIZE {
            return Err(CodecError::UnexpectedEof);
        }

        let rbsp = nal::remove_emulation_prevention(&nal_unit[hevc::HEADER_SIZE..]);
        let mut reader = BitReader::new(&rbsp);
        let nal_unit_type = hevc::nal_type(nal_unit[0]);

        let first_slice_segment_in_pic = reader.read_bit()?;
        if (hevc::BLA_W_LP..=hevc::RSV_IRAP_VCL23).contains(&nal_unit_type) {
            reader.read_bit()?; // no_output_of_prior_pics_flag
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

        let mut dependent_slice_segment = false;
        if !first_slice_segment_in_pic {
            if pps.dependent_slice_segments_enabled {
                dependent_slice_segment = reader.read_bit()?;
            }
            let ctb_size = 1u32 << (sps.log2_min_luma_coding_block_size + sps.log2_diff_max_min_luma_coding_block_size);
            let pic_size_in_ctbs = sps.pic_width_in_luma_samples.div_ceil(ctb_size)
                * sps.pic_height_in_luma_samples.div_ceil(ctb_size);
            reader.skip_bits(u64::from(ceil_log2(pic_size_in_ctbs)))?; // slice_segment_address
        }

        if !dependent_slice_segment {
            Self::skip_independent_fields(&mut reader, sps, pps, nal_unit_type)?;
        }

        if pps.tiles_enabled || pps.entropy_coding_sync_enabled {
            let num_entry_point_offsets = reader.read_ue()?;
            if num_entry_point_offsets > 0 {
                let offset_len = u64::from(reader.read_ue()?) + 1;
                reader.skip_bits(u64::from(num_entry_point_offsets) * offset_len)?;
            }
        }

        if pps.slice_segment_header_extension_present {
            let length = reader.read_ue()?;
            reader.skip_bits(u64::from(length) * 8)?; // slice_segment_header_extension_data_byte
        }

        // byte_alignment()
        if !reader.read_bit()? {
            return Err(CodecError::bad_data("invalid alignment one bit"));
        }
        while !reader.is_byte_aligned() {
            if reader.read_bit()? {
                return Err(CodecError::bad_data("invalid alignment zero bit"));
            }
        }

        Ok(encoded_header_size(hevc::HEADER_SIZE, &rbsp, reader.bytes_touched()))
    }

    fn skip_independent_fields(reader: &mut BitReader<'_>, sps: &Sps, pps: &Pps, nal_unit_type: u8) -> Result<()> {
        reader.skip_bits(u64::from(pps.num_extra_slice_header_bits))?; // slice_reserved_flag
        let slice_type = reader.read_ue()?;
        if pps.output_flag_present {
            reader.read_bit()?; // pic_output_flag
        }
        if sps.separate_colour_plane {
            reader.skip_bits(2)?; // colour_plane_id
        }

        let mut st_rps_used = 0;
        let mut lt_used_by_curr_pic_sum = 0;
        let mut slice_temporal_mvp_enabled = false;

        if nal_unit_type != hevc::IDR_W_RADL && nal_unit_type != hevc::IDR_N_LP {
            reader.skip_bits(u64::from(sps.log2_max_pic_order_cnt_lsb))?; // slice_pic_order_cnt_lsb

            let num_sets = sps.st_rps.len();
            if !reader.read_bit()? {
                // short_term_ref_pic_set_sps_flag == 0
                let rps = parse_st_ref_pic_set(reader, &sps.st_rps, num_sets, num_sets)?;
                st_rps_used = rps.used_count();
            } else {
                if num_sets == 0 {
                    return Err(CodecError::bad_data("num_short_term_ref_pic_sets is zero"));
                }
                let idx = if num_sets > 1 {
                    reader.read_bits(ceil_log2(num_sets as u32))? as usize
                } else {
                    0
                };
                let rps = sps
                    .st_rps
                    .get(idx)
                    .ok_or_else(|| CodecError::bad_data(format!("invalid short_term_ref_pic_set_idx {idx}")))?;
                st_rps_used = rps.used_count();
            }

            if sps.long_term_ref_pics_present {
                let mut num_long_term_sps = 0;
                if sps.num_long_term_ref_pics_sps > 0 {
                    num_long_term_sps = reader.read_ue()?;
                }
                let num_long_term_pics = reader.read_ue()?;
                for i in 0..u64::from(num_long_term_sps) + u64::from(num_long_term_pics) {
                    if i < u64::from(num_long_term_sps) {
                        if sps.num_long_term_ref_pics_sps > 1 {
                            let lt_idx_sps = reader.read_bits(ceil_log2(sps.num_long_term_ref_pics_sps))?;
                            lt_used_by_curr_pic_sum += (sps.used_by_curr_pic_lt_sps >> lt_idx_sps) & 1;
                        }
                    } else {
                        reader.skip_bits(u64::from(sps.log2_max_pic_order_cnt_lsb))?; // poc_lsb_lt
                        lt_used_by_curr_pic_sum += u32::from(reader.read_bit()?); // used_by_curr_pic_lt_flag
                    }
                    if reader.read_bit()? {
                        reader.skip_exp_golomb()?; // delta_poc_msb_cycle_lt
                    }
                }
            }

            if sps.temporal_mvp_enabled {
                slice_temporal_mvp_enabled = reader.read_bit()?;
            }
        }

        let mut slice_sao_luma = false;
        let mut slice_sao_chroma = false;
        if sps.sample_adaptive_offset_enabled {
            slice_sao_luma = reader.read_bit()?;
            if sps.chroma_array_type() != 0 {
                slice_sao_chroma = reader.read_bit()?;
            }
        }

        if slice_type == SLICE_P || slice_type == SLICE_B {
            let mut num_ref_idx = pps.num_ref_idx;
            if reader.read_bit()? {
                // num_ref_idx_active_override_flag
                num_ref_idx[0] = reader.read_ue()? + 1;
                if slice_type == SLICE_B {
                    num_ref_idx[1] = reader.read_ue()? + 1;
                }
            }

            if pps.lists_modification_present {
                let num_pic_total_curr = st_rps_used + lt_used_by_curr_pic_sum + u32::from(pps.curr_pic_ref_enabled);
                if num_pic_total_curr > 1 {
                    let entry_bits = u64::from(ceil_log2(num_pic_total_curr));
                    if reader.read_bit()? {
                        reader.skip_bits(u64::from(num_ref_idx[0]) * entry_bits)?; // list_entry_l0
                    }
                    if slice_type == SLICE_B && reader.read_bit()? {
                        reader.skip_bits(u64::from(num_ref_idx[1]) * entry_bits)?; // list_entry_l1
                    }
                }
            }

            if slice_type == SLICE_B {
                reader.read_bit()?; // mvd_l1_zero_flag
            }
            if pps.cabac_init_present {
                reader.read_bit()?; // cabac_init_flag
            }
            if slice_temporal_mvp_enabled {
                let mut collocated_from_l0 = true;
                if slice_type == SLICE_B {
                    collocated_from_l0 = reader.read_bit()?;
                }
                if (collocated_from_l0 && num_ref_idx[0] > 1) || (!collocated_from_l0 && num_ref_idx[1] > 1) {
                    reader.skip_exp_golomb()?; // collocated_ref_idx
                }
            }

            if (pps.weighted_pred && slice_type == SLICE_P) || (pps.weighted_bipred && slice_type == SLICE_B) {
                skip_pred_weight_table(reader, slice_type, num_ref_idx, sps.chroma_array_type())?;
            }

            reader.skip_exp_golomb()?; // five_minus_max_num_merge_cand
            if sps.motion_vector_resolution_control_idc == 2 {
                reader.read_bit()?; // use_integer_mv_flag
            }
        }

        reader.skip_exp_golomb()?; // slice_qp_delta
        if pps.slice_chroma_qp_offsets_present {
            reader.skip_exp_golomb()?; // slice_cb_qp_offset
            reader.skip_exp_golomb()?; // slice_cr_qp_offset
        }
        if pps.slice_act_qp_offsets_present {
            for _ in 0..3 {
                reader.skip_exp_golomb()?; // slice_act_{y,cb,cr}_qp_offset
            }
        }
        if pps.chroma_qp_offset_list_enabled {
            reader.read_bit()?; // cu_chroma_qp_offset_enabled_flag
        }

        let mut deblocking_filter_override = false;
        if pps.deblocking_filter_override_enabled {
            deblocking_filter_override = reader.read_bit()?;
        }
        let slice_deblocking_filter_disabled = if deblocking_filter_override {
            let disabled = reader.read_bit()?;
            if !disabled {
                reader.skip_exp_golomb()?; // slice_beta_offset_div2
                reader.skip_exp_golomb()?; // slice_tc_offset_div2
            }
            disabled
        } else {
            pps.deblocking_filter_disabled
        };

        if pps.loop_filter_across_slices_enabled
            && (slice_sao_luma || slice_sao_chroma || !slice_deblocking_filter_disabled)
        {
            reader.read_bit()?; // slice_loop_filter_across_slices_enabled_flag
        }
        Ok(())
    }

    /// Whether a NAL unit with this header byte carries slice data
    pub fn is_slice(header: u8) -> bool {
        let nal_type = hevc::nal_type(header);
        nal_type <= hevc::RASL_R || (hevc::BLA_W_LP..=hevc::CRA_NUT).contains(&nal_type)
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
