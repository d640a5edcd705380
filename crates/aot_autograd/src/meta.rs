//! What tracing learned about how a function aliases and mutates its arguments.

use serde::Serialize;

use aot_tensor::{TensorMeta, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct InputAliasInfo {
    pub is_leaf: bool,
    pub mutates_data: bool,
    /// Only sizes, strides or offset changed. Combined with `mutates_data` when both did.
    pub mutates_metadata: bool,
}

impl InputAliasInfo {
    pub fn is_mutated(&self) -> bool {
        self.mutates_data || self.mutates_metadata
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum OutputType {
    /// A fresh value.
    NonAlias,
    /// A view of input `base_idx`.
    AliasOfInput,
    /// Input `base_idx` itself.
    IsInput,
    /// A view of an intermediate which is appended to the compiled outputs as intermediate base
    /// `base_idx`.
    AliasOfIntermediateKeptAsOutput,
    /// A view of intermediate base `base_idx`, which an earlier output already caused to be kept.
    AliasOfIntermediate,
    /// A view of user output `base_idx`.
    AliasOfIntermediateThatIsAlsoUserOutput,
    /// A view of an intermediate no other output aliases, returned as a fresh value.
    UnsafeViewAlias,
}

impl OutputType {
    /// Whether the runtime wrapper regenerates this output instead of returning the compiled
    /// value.
    pub fn is_regenerated(self) -> bool {
        !matches!(self, OutputType::NonAlias | OutputType::UnsafeViewAlias)
    }

    pub fn aliases_input(self) -> bool {
        matches!(self, OutputType::AliasOfInput | OutputType::IsInput)
    }

    pub fn aliases_intermediate(self) -> bool {
        matches!(
            self,
            OutputType::AliasOfIntermediate
                | OutputType::AliasOfIntermediateKeptAsOutput
                | OutputType::AliasOfIntermediateThatIsAlsoUserOutput
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct OutputAliasInfo {
    pub output_type: OutputType,
    pub raw_type: ValueKind,
    /// Present iff `output_type` is not `NonAlias` or `UnsafeViewAlias`. Which list it indexes
    /// depends on `output_type`.
    pub base_idx: Option<usize>,
}

impl OutputAliasInfo {
    pub fn non_alias(raw_type: ValueKind) -> Self {
        OutputAliasInfo {
            output_type: OutputType::NonAlias,
            raw_type,
            base_idx: None,
        }
    }

    /// Whether the backward pass receives a gradient for this output.
    pub fn is_tangent(&self) -> bool {
        !self.output_type.is_regenerated() && self.raw_type == ValueKind::Tensor
    }
}

/// Aliasing and mutation behavior of a flat function for one calling signature.
///
/// The compiled forward returns `(mutated inputs, outputs, intermediate bases)`, where mutated
/// inputs are listed in input order. `requires_grad_info` covers the first two groups.
#[derive(Clone, Debug, Serialize)]
pub struct ViewAndMutationMeta {
    pub input_info: Vec<InputAliasInfo>,
    pub output_info: Vec<OutputAliasInfo>,
    pub requires_grad_info: Vec<bool>,
    pub num_intermediate_bases: usize,
    pub keep_input_mutations: bool,
    /// Metadata of every value which receives a gradient in the backward pass: data-mutated
    /// inputs, then tangent outputs, then intermediate bases.
    pub traced_tangents: Vec<TensorMeta>,

    #[serde(skip)]
    derived: Derived,
}

#[derive(Clone, Debug, Default)]
struct Derived {
    mutated_inp_indices: Vec<usize>,
    mutated_inp_runtime_indices: Vec<usize>,
    aliased_out_indices: Vec<usize>,
    num_outputs_non_aliased: usize,
    num_outputs_aliased_to_inputs: usize,
    num_outputs_aliased_to_intermediates: usize,
    num_mutated_data_inputs: usize,
    num_mutated_metadata_inputs: usize,
    num_mutated_metadata_only_inputs: usize,
}

impl ViewAndMutationMeta {
    pub fn new(
        input_info: Vec<InputAliasInfo>,
        output_info: Vec<OutputAliasInfo>,
        requires_grad_info: Vec<bool>,
        num_intermediate_bases: usize,
        keep_input_mutations: bool,
        traced_tangents: Vec<TensorMeta>,
    ) -> Self {
        let mutated_inp_indices = input_info
            .iter()
            .enumerate()
            .filter(|(_, info)| info.is_mutated())
            .map(|(i, _)| i)
            .collect();
        // Data-only mutations stay in the graph when input mutations are kept.
        let mutated_inp_runtime_indices = input_info
            .iter()
            .enumerate()
            .filter(|(_, info)| {
                info.mutates_metadata || (!keep_input_mutations && info.mutates_data)
            })
            .map(|(i, _)| i)
            .collect();
        let aliased_out_indices = output_info
            .iter()
            .enumerate()
            .filter(|(_, info)| info.output_type.is_regenerated())
            .map(|(i, _)| i)
            .collect();

        let count_outputs = |pred: fn(OutputType) -> bool| {
            output_info.iter().filter(|o| pred(o.output_type)).count()
        };
        let count_inputs =
            |pred: fn(&InputAliasInfo) -> bool| input_info.iter().filter(|i| pred(i)).count();

        let derived = Derived {
            mutated_inp_indices,
            mutated_inp_runtime_indices,
            aliased_out_indices,
            num_outputs_non_aliased: count_outputs(|t| !t.is_regenerated()),
            num_outputs_aliased_to_inputs: count_outputs(OutputType::aliases_input),
            num_outputs_aliased_to_intermediates: count_outputs(OutputType::aliases_intermediate),
            num_mutated_data_inputs: count_inputs(|i| i.mutates_data),
            num_mutated_metadata_inputs: count_inputs(|i| i.mutates_metadata),
            num_mutated_metadata_only_inputs: count_inputs(|i| {
                i.mutates_metadata && !i.mutates_data
            }),
        };

        ViewAndMutationMeta {
            input_info,
            output_info,
            requires_grad_info,
            num_intermediate_bases,
            keep_input_mutations,
            traced_tangents,
            derived,
        }
    }

    /// Indices of inputs with any mutation, in input order.
    pub fn mutated_inp_indices(&self) -> &[usize] {
        &self.derived.mutated_inp_indices
    }

    /// Indices of inputs whose mutations the runtime wrapper applies.
    pub fn mutated_inp_runtime_indices(&self) -> &[usize] {
        &self.derived.mutated_inp_runtime_indices
    }

    pub fn aliased_out_indices(&self) -> &[usize] {
        &self.derived.aliased_out_indices
    }

    pub fn num_outputs(&self) -> usize {
        self.output_info.len()
    }

    pub fn num_outputs_non_aliased(&self) -> usize {
        self.derived.num_outputs_non_aliased
    }

    pub fn num_outputs_aliased_to_inputs(&self) -> usize {
        self.derived.num_outputs_aliased_to_inputs
    }

    pub fn num_outputs_aliased_to_intermediates(&self) -> usize {
        self.derived.num_outputs_aliased_to_intermediates
    }

    pub fn num_outputs_aliased(&self) -> usize {
        self.num_outputs_aliased_to_inputs() + self.num_outputs_aliased_to_intermediates()
    }

    pub fn num_mutated_data_inputs(&self) -> usize {
        self.derived.num_mutated_data_inputs
    }

    pub fn num_mutated_metadata_inputs(&self) -> usize {
        self.derived.num_mutated_metadata_inputs
    }

    pub fn num_mutated_metadata_only_inputs(&self) -> usize {
        self.derived.num_mutated_metadata_only_inputs
    }

    pub fn num_mutated_inputs(&self) -> usize {
        self.num_mutated_data_inputs() + self.num_mutated_metadata_only_inputs()
    }

    /// Number of data mutations left in an inference graph as a trailing `copy_`.
    pub fn num_kept_input_mutations(&self) -> usize {
        if !self.keep_input_mutations {
            return 0;
        }
        self.input_info
            .iter()
            .filter(|info| info.mutates_data && !info.mutates_metadata)
            .count()
    }

    /// Length of the `(mutated inputs, outputs, intermediate bases)` prefix of the compiled
    /// forward's results.
    pub fn num_forward_returns(&self) -> usize {
        self.num_mutated_inputs() + self.num_outputs() + self.num_intermediate_bases
    }

    /// Which of the compiled forward's returns receive a gradient in the backward pass.
    pub fn tangent_mask(&self) -> Vec<bool> {
        let inputs = self
            .mutated_inp_indices()
            .iter()
            .map(|&i| self.input_info[i].mutates_data);
        let outputs = self.output_info.iter().map(OutputAliasInfo::is_tangent);
        let bases = std::iter::repeat(true).take(self.num_intermediate_bases);
        inputs.chain(outputs).chain(bases).collect()
    }
}

impl PartialEq for ViewAndMutationMeta {
    fn eq(&self, other: &Self) -> bool {
        self.input_info == other.input_info
            && self.output_info == other.output_info
            && self.requires_grad_info == other.requires_grad_info
            && self.num_intermediate_bases == other.num_intermediate_bases
            && self.keep_input_mutations == other.keep_input_mutations
            && self.traced_tangents.len() == other.traced_tangents.len()
            && self
                .traced_tangents
                .iter()
                .zip(&other.traced_tangents)
                .all(|(a, b)| a.sizes() == b.sizes() && a.dtype == b.dtype)
    }
}
