use crate::codec::DxxVersion;

// Weapon-info indices as emitted by the game in gamelog kill packets.
const D1_WEAPONS: &[(u8, &str)] = &[
    (0, "Laser Lvl 1"),
    (1, "Laser Lvl 2"),
    (2, "Laser Lvl 3"),
    (3, "Laser Lvl 4"),
    (8, "Concussion Missile"),
    (9, "Flare"),
    (10, "Blue Laser Blob"),
    (11, "Vulcan Cannon"),
    (12, "Spreadfire Cannon"),
    (13, "Plasma Cannon"),
    (14, "Fusion Cannon"),
    (15, "Homing Missile"),
    (16, "Proximity Bomb"),
    (17, "Smart Missile"),
    (18, "Mega Missile"),
];

const D2_EXTRA_WEAPONS: &[(u8, &str)] = &[
    (30, "Super Laser Lvl 5"),
    (31, "Super Laser Lvl 6"),
    (32, "Gauss Cannon"),
    (33, "Helix Cannon"),
    (34, "Phoenix Cannon"),
    (35, "Omega Cannon"),
    (36, "Flash Missile"),
    (37, "Guided Missile"),
    (38, "Smart Mine"),
    (39, "Mercury Missile"),
    (40, "Earthshaker Missile"),
];

/// Non-weapon kill sources carried in the weapon-type byte.
const KILL_SOURCES: &[(u8, &str)] = &[(1, "Robot"), (2, "Mine"), (3, "Reactor"), (4, "Lava")];

pub fn weapon_name(version: DxxVersion, weapon_type: u8, weapon_id: u8) -> String {
    if weapon_type != 0 {
        if let Some((_, name)) = KILL_SOURCES.iter().find(|(id, _)| *id == weapon_type) {
            return (*name).to_owned();
        }
        return format!("Unknown ({weapon_type}/{weapon_id})");
    }
    let extra = match version {
        DxxVersion::D1 => &[][..],
        DxxVersion::D2 => D2_EXTRA_WEAPONS,
    };
    D1_WEAPONS
        .iter()
        .chain(extra)
        .find(|(id, _)| *id == weapon_id)
        .map(|(_, name)| (*name).to_owned())
        .unwrap_or_else(|| format!("Weapon {weapon_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_plasma_cannon_for_both_versions() {
        assert_eq!(weapon_name(DxxVersion::D1, 0, 13), "Plasma Cannon");
        assert_eq!(weapon_name(DxxVersion::D2, 0, 13), "Plasma Cannon");
    }

    #[test]
    fn d2_extends_the_table_without_leaking_into_d1() {
        assert_eq!(weapon_name(DxxVersion::D2, 0, 32), "Gauss Cannon");
        assert_eq!(weapon_name(DxxVersion::D1, 0, 32), "Weapon 32");
    }

    #[test]
    fn non_weapon_sources_use_the_type_byte() {
        assert_eq!(weapon_name(DxxVersion::D1, 3, 0), "Reactor");
        assert_eq!(weapon_name(DxxVersion::D1, 9, 7), "Unknown (9/7)");
    }
}
