/// Render the `set flags = ...` expression for an add/clear mask pair,
/// numbering the mask placeholders from `first_param`. When only one of
/// the masks is non-zero the expression collapses to a single operator.
pub(crate) fn expr(add: i32, clear: i32, first_param: usize) -> (String, Vec<i32>) {
    match (add, clear) {
        (0, c) => (format!("flags & ~${first_param}"), vec![c]),
        (a, 0) => (format!("flags | ${first_param}"), vec![a]),
        (a, c) => (
            format!("(flags & ~${first_param}) | ${}", first_param + 1),
            vec![c, a],
        ),
    }
}

#[cfg(test)]
mod test {
    use super::expr;

    #[test]
    fn collapses_single_sided_masks() {
        assert_eq!(expr(6, 0, 3), ("flags | $3".to_owned(), vec![6]));
        assert_eq!(expr(0, 6, 3), ("flags & ~$3".to_owned(), vec![6]));
        assert_eq!(
            expr(2, 4, 5),
            ("(flags & ~$5) | $6".to_owned(), vec![4, 2])
        );
    }
}
