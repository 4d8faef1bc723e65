//! Wi-Fi channel numbering.

/// 5 GHz center channels for 40 MHz operation.
const CENTER_CHANNELS_40: &[u32] = &[38, 46, 54, 62, 102, 110, 118, 126, 134, 142, 151, 159, 167, 175];

/// 5 GHz center channels for 80 MHz operation.
const CENTER_CHANNELS_80: &[u32] = &[42, 58, 106, 122, 138, 155, 171];

/// 5 GHz center channels for 160 MHz operation.
const CENTER_CHANNELS_160: &[u32] = &[50, 114, 163];

/// Center frequency in MHz of a 2.4 GHz or 5 GHz channel.
pub fn channel_to_freq(channel: u32) -> Option<u32> {
    match channel {
        1..=13 => Some(2407 + 5 * channel),
        14 => Some(2484),
        32..=177 => Some(5000 + 5 * channel),
        _ => None,
    }
}

/// Center channel of the `bandwidth` MHz block containing primary `channel`.
pub fn center_channel(channel: u32, bandwidth: u32) -> Option<u32> {
    match (channel, bandwidth) {
        (_, 20) => channel_to_freq(channel).map(|_| channel),
        // HT40+ below channel 8, HT40- above.
        (1..=7, 40) => Some(channel + 2),
        (8..=13, 40) => Some(channel - 2),
        (32..=177, 40) => find_center(channel, bandwidth, CENTER_CHANNELS_40),
        (32..=177, 80) => find_center(channel, bandwidth, CENTER_CHANNELS_80),
        (32..=177, 160) => find_center(channel, bandwidth, CENTER_CHANNELS_160),
        _ => None,
    }
}

fn find_center(channel: u32, bandwidth: u32, centers: &[u32]) -> Option<u32> {
    // 20 MHz sub-channels sit at center +/- 2, 6, 10, 14.
    let max_offset = bandwidth / 10 - 2;
    centers.iter().copied().find(|&center| {
        let offset = channel.abs_diff(center);
        offset <= max_offset && (offset + 2) % 4 == 0
    })
}
