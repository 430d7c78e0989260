//! Classification of how each argument and the return value travel under a
//! profile's calling convention.

use crate::layout::{AbiProfile, AggregateRule, Layout};

use super::CallDescriptor;

/// How one by-value argument reaches the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgPass {
    Direct,
    /// A pointer to a caller-made copy, with the copy's alignment.
    IndirectByVal { align: usize },
}

/// How the return value reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetPass {
    Void,
    Direct,
    /// The caller pre-allocates the return buffer and passes its address
    /// as a hidden first argument.
    IndirectSret { align: usize },
}

/// Per-signature classification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedCall {
    pub params: Vec<ArgPass>,
    pub ret: RetPass,
}

fn is_aggregate(layout: &Layout) -> bool {
    matches!(layout, Layout::Group { .. } | Layout::Sequence { .. })
}

fn aggregate_param_indirect(size: usize, profile: &AbiProfile) -> bool {
    match profile.aggregate_rule() {
        AggregateRule::SizeAtMost { bytes } => size > bytes,
        AggregateRule::ExactRegisterSizes => !matches!(size, 1 | 2 | 4 | 8),
    }
}

fn aggregate_return_indirect(size: usize, profile: &AbiProfile) -> bool {
    match profile.aggregate_rule() {
        AggregateRule::SizeAtMost { .. } => size > profile.return_threshold(),
        AggregateRule::ExactRegisterSizes => !matches!(size, 1 | 2 | 4 | 8),
    }
}

fn indirect_align(layout: &Layout, profile: &AbiProfile) -> usize {
    let align = layout.alignment(profile);
    match profile.aggregate_rule() {
        // SysV copies get at least stack-slot alignment.
        AggregateRule::SizeAtMost { .. } => align.max(8),
        AggregateRule::ExactRegisterSizes => align,
    }
}

/// Classify every parameter and the return of `descriptor` under `profile`.
#[must_use]
pub fn classify_call(descriptor: &CallDescriptor, profile: &AbiProfile) -> ClassifiedCall {
    let params = descriptor
        .params()
        .iter()
        .map(|layout| {
            if is_aggregate(layout) && aggregate_param_indirect(layout.byte_size(profile), profile)
            {
                ArgPass::IndirectByVal {
                    align: indirect_align(layout, profile),
                }
            } else {
                ArgPass::Direct
            }
        })
        .collect();

    let ret = match descriptor.ret() {
        None => RetPass::Void,
        Some(layout) => {
            if is_aggregate(layout) && aggregate_return_indirect(layout.byte_size(profile), profile)
            {
                RetPass::IndirectSret {
                    align: layout.alignment(profile),
                }
            } else {
                RetPass::Direct
            }
        }
    };

    ClassifiedCall { params, ret }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Member;

    fn descriptor(params: Vec<Layout>, ret: Option<Layout>) -> CallDescriptor {
        match CallDescriptor::new(params, ret) {
            Ok(descriptor) => descriptor,
            Err(err) => panic!("descriptor should build: {err}"),
        }
    }

    fn trio_of_int64() -> Layout {
        Layout::group(vec![
            Member::named("a", Layout::int64()),
            Member::named("b", Layout::int64()),
            Member::named("c", Layout::int64()),
        ])
    }

    #[test]
    fn sysv_indirects_large_aggregate_return_and_param() {
        let profile = AbiProfile::natural();
        let classified = classify_call(
            &descriptor(vec![trio_of_int64()], Some(trio_of_int64())),
            &profile,
        );
        assert!(matches!(
            classified.params[0],
            ArgPass::IndirectByVal { align } if align >= 8
        ));
        assert!(matches!(classified.ret, RetPass::IndirectSret { .. }));
    }

    #[test]
    fn sysv_passes_register_sized_aggregates_directly() {
        let profile = AbiProfile::natural();
        let pair = Layout::group(vec![
            Member::named("a", Layout::int64()),
            Member::named("b", Layout::float64()),
        ]);
        let classified = classify_call(&descriptor(vec![pair.clone()], Some(pair)), &profile);
        assert_eq!(classified.params[0], ArgPass::Direct);
        assert_eq!(classified.ret, RetPass::Direct);
    }

    #[test]
    fn register_size_rule_indirects_non_power_of_two_aggregates() {
        // The Windows convention: only 1/2/4/8-byte aggregates stay direct.
        let windows = match crate::target::Target::parse("x86_64-pc-windows") {
            Ok(target) => AbiProfile::for_target(&target),
            Err(err) => panic!("windows triple should parse: {err}"),
        };
        let pair = Layout::group(vec![
            Member::named("a", Layout::int32()),
            Member::named("b", Layout::int32()),
        ]);
        let trio = Layout::group(vec![
            Member::named("a", Layout::int32()),
            Member::named("b", Layout::int32()),
            Member::named("c", Layout::int32()),
        ]);
        let classified = classify_call(&descriptor(vec![pair, trio], None), &windows);
        assert_eq!(classified.params[0], ArgPass::Direct);
        assert!(matches!(
            classified.params[1],
            ArgPass::IndirectByVal { .. }
        ));
    }

    #[test]
    fn power_open_returns_every_aggregate_through_memory() {
        let profile = AbiProfile::power_open();
        let int_double = Layout::group(vec![
            Member::named("elem1", Layout::int32()),
            Member::named("elem2", Layout::float64()),
        ]);
        let classified = classify_call(&descriptor(Vec::new(), Some(int_double)), &profile);
        assert!(matches!(classified.ret, RetPass::IndirectSret { .. }));
    }

    #[test]
    fn scalars_always_travel_directly() {
        let profile = AbiProfile::natural();
        let classified = classify_call(
            &descriptor(
                vec![Layout::int32(), Layout::float64(), Layout::pointer()],
                Some(Layout::int64()),
            ),
            &profile,
        );
        assert!(classified.params.iter().all(|pass| *pass == ArgPass::Direct));
        assert_eq!(classified.ret, RetPass::Direct);
    }
}
