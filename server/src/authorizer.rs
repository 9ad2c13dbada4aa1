//! The placement decision pipeline: classifies one proposed block change.
//!
//! Evaluation order is first-match-wins: special block-type gates, then the
//! zone layer, then the world-level policy combined with the generic build
//! and delete permissions. Callers apply [`plan_placement`] first so the
//! stair-stacking rewrite is authorized at its rewritten coordinates.

use shared::{Block, Position};

use crate::access::SecurityCheck;
use crate::player::PlayerInfo;
use crate::rank::Permission;
use crate::world::World;
use crate::zone::ZoneOverride;

/// Outcome of a placement authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanPlaceResult {
    Allowed,
    BlocktypeDenied,
    WorldDenied,
    ZoneDenied,
    RankDenied,
}

impl CanPlaceResult {
    pub fn allowed(self) -> bool {
        self == CanPlaceResult::Allowed
    }
}

/// Rewrites a proposed placement before authorization. Placing a stair
/// directly on top of another stair becomes a double stair one layer down;
/// everything else passes through unchanged.
pub fn plan_placement(world: &World, pos: Position, block: Block) -> (Position, Block) {
    if block == Block::Stair
        && pos.h > 0
        && world.map().block_at(pos.below()) == Some(Block::Stair)
    {
        (pos.below(), Block::DoubleStair)
    } else {
        (pos, block)
    }
}

/// Decides whether `actor` may change the block at `pos` to `new_block`.
pub fn can_place(
    world: &World,
    actor: &PlayerInfo,
    pos: Position,
    new_block: Block,
) -> CanPlaceResult {
    // A target outside the world is a world-level refusal.
    let Some(old_block) = world.map().block_at(pos) else {
        return CanPlaceResult::WorldDenied;
    };

    // Special block types gate before any zone or world check.
    if new_block == Block::Admincrete && !actor.can(Permission::PlaceAdmincrete) {
        return CanPlaceResult::BlocktypeDenied;
    }
    if new_block.is_water() && !actor.can(Permission::PlaceWater) {
        return CanPlaceResult::BlocktypeDenied;
    }
    if new_block.is_lava() && !actor.can(Permission::PlaceLava) {
        return CanPlaceResult::BlocktypeDenied;
    }
    if old_block == Block::Admincrete && !actor.can(Permission::DeleteAdmincrete) {
        return CanPlaceResult::BlocktypeDenied;
    }

    let key = actor.name().to_string();
    let rank = actor.rank();

    match world.zones.check(pos, &key, &rank) {
        ZoneOverride::Allow => return CanPlaceResult::Allowed,
        ZoneOverride::Deny => return CanPlaceResult::ZoneDenied,
        ZoneOverride::None => {}
    }

    match world.policy.check_detailed(&key, &rank) {
        SecurityCheck::Allowed => {
            let may_build = actor.can(Permission::Build) || new_block == Block::Air;
            let may_delete = actor.can(Permission::Delete) || old_block == Block::Air;
            if may_build && may_delete {
                CanPlaceResult::Allowed
            } else {
                CanPlaceResult::RankDenied
            }
        }
        SecurityCheck::WhiteListed => CanPlaceResult::Allowed,
        SecurityCheck::RankTooLow | SecurityCheck::BlackListed => CanPlaceResult::WorldDenied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerRegistry;
    use crate::rank::RankGraph;
    use crate::world::{BlockUpdate, Map, World};
    use crate::zone::{BoundingBox, Zone};
    use shared::BlockChangeCause;
    use std::sync::Arc;

    struct Fixture {
        graph: RankGraph,
        registry: PlayerRegistry,
        world: World,
    }

    fn fixture() -> Fixture {
        let graph = RankGraph::with_defaults();
        let world = World::new("main", Map::new(16, 16, 16), graph.find("guest").unwrap());
        Fixture {
            registry: PlayerRegistry::new(8),
            graph,
            world,
        }
    }

    fn place_direct(world: &World, pos: Position, block: Block) {
        world.enqueue(BlockUpdate::new(pos, Block::Air, block, BlockChangeCause::Built));
        world.process_updates(1);
    }

    #[test]
    fn test_plain_build_allowed() {
        let f = fixture();
        let ada = f
            .registry
            .add("ada", f.graph.find("guest").unwrap())
            .unwrap();

        let result = can_place(&f.world, &ada, Position::new(1, 1, 1), Block::Stone);
        assert_eq!(result, CanPlaceResult::Allowed);
    }

    #[test]
    fn test_lava_requires_its_permission() {
        let f = fixture();
        // Builders pass every generic check but lack the lava permission...
        let guest_builder = f
            .registry
            .add("ada", f.graph.find("guest").unwrap())
            .unwrap();
        for block in [Block::Lava, Block::StillLava] {
            let result = can_place(&f.world, &guest_builder, Position::new(1, 1, 1), block);
            assert_eq!(result, CanPlaceResult::BlocktypeDenied);
        }

        // ...while a trusted builder holds it.
        let bo = f
            .registry
            .add("bo", f.graph.find("builder").unwrap())
            .unwrap();
        let result = can_place(&f.world, &bo, Position::new(1, 1, 1), Block::Lava);
        assert_eq!(result, CanPlaceResult::Allowed);
    }

    #[test]
    fn test_water_requires_its_permission() {
        let f = fixture();
        let ada = f
            .registry
            .add("ada", f.graph.find("guest").unwrap())
            .unwrap();

        let result = can_place(&f.world, &ada, Position::new(1, 1, 1), Block::StillWater);
        assert_eq!(result, CanPlaceResult::BlocktypeDenied);
    }

    #[test]
    fn test_admincrete_gates_both_ways() {
        let f = fixture();
        let op = f.registry.add("op1", f.graph.find("op").unwrap()).unwrap();
        let ada = f
            .registry
            .add("ada", f.graph.find("builder").unwrap())
            .unwrap();
        let pos = Position::new(3, 3, 3);

        assert_eq!(
            can_place(&f.world, &ada, pos, Block::Admincrete),
            CanPlaceResult::BlocktypeDenied
        );
        assert_eq!(
            can_place(&f.world, &op, pos, Block::Admincrete),
            CanPlaceResult::Allowed
        );

        // Overwriting placed admincrete needs the delete permission for it.
        place_direct(&f.world, pos, Block::Admincrete);
        assert_eq!(
            can_place(&f.world, &ada, pos, Block::Air),
            CanPlaceResult::BlocktypeDenied
        );
        assert_eq!(
            can_place(&f.world, &op, pos, Block::Air),
            CanPlaceResult::Allowed
        );
    }

    #[test]
    fn test_zone_deny_beats_world_policy() {
        let f = fixture();
        let ada = f
            .registry
            .add("ada", f.graph.find("builder").unwrap())
            .unwrap();
        let bounds = BoundingBox::new(Position::new(0, 0, 0), Position::new(8, 8, 8));
        f.world
            .zones
            .add(Zone::new("vault", bounds, f.graph.find("op").unwrap(), "admin"))
            .unwrap();

        assert_eq!(
            can_place(&f.world, &ada, Position::new(4, 4, 4), Block::Stone),
            CanPlaceResult::ZoneDenied
        );
        // Outside the zone the world policy applies again.
        assert_eq!(
            can_place(&f.world, &ada, Position::new(12, 12, 12), Block::Stone),
            CanPlaceResult::Allowed
        );
    }

    #[test]
    fn test_zone_allow_short_circuits_world_policy() {
        let f = fixture();
        // World policy requires op rank; the zone allows guests.
        f.world.policy.set_min_rank(f.graph.find("op").unwrap());
        let ada = f
            .registry
            .add("ada", f.graph.find("guest").unwrap())
            .unwrap();
        let bounds = BoundingBox::new(Position::new(0, 0, 0), Position::new(8, 8, 8));
        f.world
            .zones
            .add(Zone::new("commons", bounds, f.graph.find("guest").unwrap(), "admin"))
            .unwrap();

        assert_eq!(
            can_place(&f.world, &ada, Position::new(4, 4, 4), Block::Stone),
            CanPlaceResult::Allowed
        );
        assert_eq!(
            can_place(&f.world, &ada, Position::new(12, 12, 12), Block::Stone),
            CanPlaceResult::WorldDenied
        );
    }

    #[test]
    fn test_whitelist_bypasses_generic_permissions() {
        let mut f = fixture();
        // A bare rank with no build/delete permission at all.
        let bare = f.graph.insert(crate::rank::Rank::new("visitor", "rank-visitor"), 4).unwrap();
        f.world.policy.set_min_rank(f.graph.find("op").unwrap());
        let ada = f.registry.add("ada", Arc::clone(&bare)).unwrap();

        assert_eq!(
            can_place(&f.world, &ada, Position::new(1, 1, 1), Block::Stone),
            CanPlaceResult::WorldDenied
        );

        f.world.policy.include("ada".to_string());
        assert_eq!(
            can_place(&f.world, &ada, Position::new(1, 1, 1), Block::Stone),
            CanPlaceResult::Allowed
        );
    }

    #[test]
    fn test_rank_denied_without_generic_build() {
        let mut f = fixture();
        let bare = f.graph.insert(crate::rank::Rank::new("visitor", "rank-visitor"), 4).unwrap();
        // Rank passes the world gate but has neither build nor delete.
        f.world.policy.set_min_rank(Arc::clone(&bare));
        let ada = f.registry.add("ada", Arc::clone(&bare)).unwrap();

        assert_eq!(
            can_place(&f.world, &ada, Position::new(1, 1, 1), Block::Stone),
            CanPlaceResult::RankDenied
        );
    }

    #[test]
    fn test_excluded_actor_world_denied() {
        let f = fixture();
        let ada = f
            .registry
            .add("ada", f.graph.find("op").unwrap())
            .unwrap();
        f.world.policy.exclude("ada".to_string());

        assert_eq!(
            can_place(&f.world, &ada, Position::new(1, 1, 1), Block::Stone),
            CanPlaceResult::WorldDenied
        );
    }

    #[test]
    fn test_out_of_bounds_world_denied() {
        let f = fixture();
        let ada = f
            .registry
            .add("ada", f.graph.find("op").unwrap())
            .unwrap();

        assert_eq!(
            can_place(&f.world, &ada, Position::new(99, 1, 1), Block::Stone),
            CanPlaceResult::WorldDenied
        );
    }

    #[test]
    fn test_stair_stacking_rewrite() {
        let f = fixture();
        let below = Position::new(5, 5, 4);
        let above = Position::new(5, 5, 5);
        place_direct(&f.world, below, Block::Stair);

        let (pos, block) = plan_placement(&f.world, above, Block::Stair);
        assert_eq!(pos, below);
        assert_eq!(block, Block::DoubleStair);

        // No stair underneath: the placement is untouched.
        let (pos, block) = plan_placement(&f.world, Position::new(9, 9, 9), Block::Stair);
        assert_eq!(pos, Position::new(9, 9, 9));
        assert_eq!(block, Block::Stair);

        // Ground level cannot be rewritten downward.
        let (pos, block) = plan_placement(&f.world, Position::new(5, 5, 0), Block::Stair);
        assert_eq!(pos, Position::new(5, 5, 0));
        assert_eq!(block, Block::Stair);
    }
}
