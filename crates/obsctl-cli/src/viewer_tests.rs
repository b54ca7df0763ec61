use crate::viewer::push_key;

#[test]
fn buffer_keeps_the_last_eight_characters_of_multibyte_input() {
    // Arrange
    let mut buffer = String::new();

    // Act
    for c in "réglé à été".chars() {
        assert!(!push_key(&mut buffer, c));
    }

    // Assert
    assert_eq!(buffer.chars().count(), 8);
    assert_eq!(buffer, "lé à été");
}

#[test]
fn typing_exit_after_noise_is_detected() {
    let mut buffer = String::new();
    for c in "ÉÉÉÉÉÉÉÉÉE".chars() {
        push_key(&mut buffer, c);
    }

    let exited = "xit".chars().map(|c| push_key(&mut buffer, c)).last();

    assert_eq!(exited, Some(true));
}
