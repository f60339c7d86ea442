pub const DEFAULT_PAGE_SIZE: usize = 256;
pub const MIN_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 2048;

/// 0 (o negativo) = tamaño por defecto; el resto se acota a [50, 2048].
pub fn clamp_page_size(requested: i64) -> usize {
    if requested <= 0 {
        return DEFAULT_PAGE_SIZE;
    }
    (requested as usize).clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 256)]
    #[case::one(1, 50)]
    #[case::below_min(49, 50)]
    #[case::min(50, 50)]
    #[case::max(2048, 2048)]
    #[case::above_max(2049, 2048)]
    #[case::negative(-5, 256)]
    fn clamps(#[case] requested: i64, #[case] expected: usize) {
        assert_eq!(clamp_page_size(requested), expected);
    }
}
