/// Canonical address of a two-party conversation, order-independent:
/// `room_key(a, b) == room_key(b, a)`. A room is a label computed on
/// demand, never a stored entity.
pub fn room_key(a: i64, b: i64) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("room_{low}_{high}")
}
